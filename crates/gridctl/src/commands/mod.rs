pub mod down;
pub mod init;
pub mod scale;
pub mod status;
pub mod up;
