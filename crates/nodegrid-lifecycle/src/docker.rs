//! Docker-backed node runtime.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::{debug, info};

use nodegrid_core::NodeRole;
use nodegrid_fabric::{DockerCli, DockerError};

use crate::error::RuntimeError;
use crate::runtime::{LaunchPlan, NodeRuntime, ObservedNode, labels};

/// Runs each node as a detached docker container.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime {
    docker: DockerCli,
}

impl DockerRuntime {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }

    /// Build the `docker run` argument list for a plan.
    pub fn run_args(plan: &LaunchPlan) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            plan.name.clone(),
            "--hostname".to_string(),
            plan.name.clone(),
            "--network".to_string(),
            plan.network.clone(),
            "--ip".to_string(),
            plan.address.to_string(),
        ];
        for (key, value) in &plan.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &plan.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &plan.mounts {
            args.push("--volume".to_string());
            args.push(format!(
                "{}:{}:ro",
                mount.source.display(),
                mount.target.display()
            ));
        }
        for port in &plan.ports {
            args.push("--publish".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }
        args.push(plan.image.clone());
        args.extend(plan.command.iter().cloned());
        args
    }

    async fn signal(&self, name: &str, signal: &str) -> Result<(), RuntimeError> {
        match self.docker.run(["kill", "--signal", signal, name]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() || is_not_running(&e) => {
                debug!(node = %name, %signal, "container not running, signal skipped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn address_of(&self, name: &str) -> Result<Option<Ipv4Addr>, RuntimeError> {
        let out = self
            .docker
            .run([
                "inspect",
                "--format",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                name,
            ])
            .await?;
        Ok(out
            .split_whitespace()
            .find_map(|candidate| candidate.parse().ok()))
    }
}

fn is_not_running(err: &DockerError) -> bool {
    matches!(err, DockerError::Failed { stderr, .. } if stderr.contains("is not running"))
}

#[async_trait]
impl NodeRuntime for DockerRuntime {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), RuntimeError> {
        let args = Self::run_args(plan);
        let id = self.docker.run(&args).await?;
        info!(
            node = %plan.name,
            role = %plan.role,
            address = %plan.address,
            container = %id.trim(),
            "container launched"
        );
        Ok(())
    }

    async fn terminate(&self, name: &str) -> Result<(), RuntimeError> {
        self.signal(name, "SIGTERM").await
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.signal(name, "SIGKILL").await
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .run(["inspect", "--format", "{{.State.Running}}", name])
            .await
        {
            Ok(out) => Ok(out.trim() == "true"),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str, purge: bool) -> Result<(), RuntimeError> {
        let result = if purge {
            self.docker.run(["rm", "--force", "--volumes", name]).await
        } else {
            self.docker.run(["rm", "--force", name]).await
        };
        match result {
            Ok(_) => {
                debug!(node = %name, purge, "container removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, cluster: &str) -> Result<Vec<ObservedNode>, RuntimeError> {
        let filter = format!("label={}={cluster}", labels::CLUSTER);
        let format = format!("{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.Label \"{}\"}}}}", labels::ROLE);
        let out = self
            .docker
            .run([
                "ps",
                "--all",
                "--filter",
                filter.as_str(),
                "--format",
                format.as_str(),
            ])
            .await?;

        let mut observed = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let Some(mut node) = parse_ps_line(line) else {
                debug!(%line, "skipping unparseable docker ps line");
                continue;
            };
            node.address = self.address_of(&node.name).await?;
            observed.push(node);
        }
        Ok(observed)
    }
}

/// Parse one `name<TAB>state<TAB>role` line from `docker ps`.
fn parse_ps_line(line: &str) -> Option<ObservedNode> {
    let mut fields = line.split('\t').map(str::trim);
    let name = fields.next().filter(|n| !n.is_empty())?;
    let state = fields.next()?;
    let role: NodeRole = fields.next()?.parse().ok()?;
    Some(ObservedNode {
        name: name.to_string(),
        role,
        running: state == "running",
        address: None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use nodegrid_core::Mount;

    use super::*;
    use crate::runtime::PortMapping;

    fn plan() -> LaunchPlan {
        LaunchPlan {
            name: "worker-1".to_string(),
            role: NodeRole::Worker,
            image: "bitnami/spark:3.5".to_string(),
            command: vec!["run-worker".to_string()],
            network: "demo-net".to_string(),
            address: Ipv4Addr::new(172, 28, 0, 3),
            env: BTreeMap::from([("MODE".to_string(), "worker".to_string())]),
            mounts: vec![Mount {
                source: PathBuf::from("/srv/data"),
                target: PathBuf::from("/opt/data"),
            }],
            ports: vec![PortMapping::same(8081)],
            labels: BTreeMap::from([(labels::CLUSTER.to_string(), "demo".to_string())]),
        }
    }

    #[test]
    fn run_args_carry_network_mounts_and_ports() {
        let args = DockerRuntime::run_args(&plan());
        let joined = args.join(" ");
        assert!(joined.starts_with("run --detach --name worker-1"));
        assert!(joined.contains("--network demo-net --ip 172.28.0.3"));
        assert!(joined.contains("--label nodegrid.cluster=demo"));
        assert!(joined.contains("--env MODE=worker"));
        assert!(joined.contains("--volume /srv/data:/opt/data:ro"));
        assert!(joined.contains("--publish 8081:8081"));
        assert!(joined.ends_with("bitnami/spark:3.5 run-worker"));
    }

    #[test]
    fn ps_lines_parse() {
        let node = parse_ps_line("worker-1\trunning\tworker").unwrap();
        assert_eq!(node.name, "worker-1");
        assert!(node.running);
        assert_eq!(node.role, NodeRole::Worker);

        let exited = parse_ps_line("coordinator\texited\tcoordinator").unwrap();
        assert!(!exited.running);
        assert_eq!(exited.role, NodeRole::Coordinator);

        assert!(parse_ps_line("stray\trunning\t").is_none());
        assert!(parse_ps_line("").is_none());
    }
}
