//! Service management over systemd or SysV init, detected per host.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::command::{Cmd, RunError, Runner};

/// The kubelet unit.
pub const KUBELET: &str = "kubelet";
/// The Docker daemon unit.
pub const DOCKER: &str = "docker";
/// The containerd unit.
pub const CONTAINERD: &str = "containerd";
/// The CRI-O unit.
pub const CRIO: &str = "crio";
/// The rkt unit.
pub const RKT: &str = "rkt";
/// The rkt API service unit.
pub const RKT_API: &str = "rkt-api";
/// The rkt metadata service unit.
pub const RKT_METADATA: &str = "rkt-metadata";
/// The in-guest scheduled stop unit.
pub const SCHEDULED_STOP: &str = "minikube-scheduled-stop";

/// Every unit name the service manager knows about.
pub const KNOWN_SERVICES: &[&str] = &[
    KUBELET,
    DOCKER,
    CONTAINERD,
    CRIO,
    RKT,
    RKT_API,
    RKT_METADATA,
    SCHEDULED_STOP,
];

/// Service manager failures that callers act on.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServiceError {
    /// kubelet must not start at boot, since it would read `/etc/hosts`
    /// before the host is configured.
    #[error("not enabling kubelet at boot: start it explicitly once the host is configured")]
    KubeletEnable,
}

/// The init system running on a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitSystem {
    /// systemd, driven with `systemctl`.
    Systemd,
    /// SysV init scripts, driven with `service`.
    SysV,
}

impl InitSystem {
    /// Name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            InitSystem::Systemd => "systemd",
            InitSystem::SysV => "SysV",
        }
    }

    /// Detects the init system: `systemctl --version` succeeding means
    /// systemd.
    pub async fn detect(runner: &dyn Runner) -> InitSystem {
        match runner.run_cmd(Cmd::new("systemctl").arg("--version")).await {
            Ok(_) => InitSystem::Systemd,
            Err(e) => {
                debug!(error = %e, "systemctl unavailable, assuming SysV");
                InitSystem::SysV
            }
        }
    }
}

/// Drives services on one host.
#[derive(Clone, Copy)]
pub struct ServiceManager<'r> {
    runner: &'r dyn Runner,
    init: InitSystem,
}

impl<'r> ServiceManager<'r> {
    /// Creates a manager for a known init system.
    pub fn new(runner: &'r dyn Runner, init: InitSystem) -> Self {
        ServiceManager { runner, init }
    }

    /// Creates a manager after detecting the host's init system.
    pub async fn detect(runner: &'r dyn Runner) -> ServiceManager<'r> {
        let init = InitSystem::detect(runner).await;
        ServiceManager { runner, init }
    }

    /// The init system in use.
    pub fn init_system(&self) -> InitSystem {
        self.init
    }

    fn systemctl(&self, args: &[&str]) -> Cmd {
        Cmd::new("sudo").arg("systemctl").args(args.iter().copied())
    }

    fn service(&self, svc: &str, action: &str) -> Cmd {
        Cmd::new("sudo").args(["service", svc, action])
    }

    async fn run(&self, cmd: Cmd) -> anyhow::Result<()> {
        self.runner.run_cmd(cmd).await?;
        Ok(())
    }

    /// Reports whether `svc` is running.
    pub async fn active(&self, svc: &str) -> bool {
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["is-active", "--quiet", "service", svc]),
            InitSystem::SysV => self.service(svc, "status"),
        };
        self.runner.run_cmd(cmd).await.is_ok()
    }

    /// Starts `svc`.
    #[instrument(level = "debug", skip(self))]
    pub async fn start(&self, svc: &str) -> anyhow::Result<()> {
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["start", svc]),
            InitSystem::SysV => self.service(svc, "start"),
        };
        self.run(cmd).await
    }

    /// Stops `svc`.
    #[instrument(level = "debug", skip(self))]
    pub async fn stop(&self, svc: &str) -> anyhow::Result<()> {
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["stop", svc]),
            InitSystem::SysV => self.service(svc, "stop"),
        };
        self.run(cmd).await
    }

    /// Stops `svc` even when other units depend on it.
    pub async fn force_stop(&self, svc: &str) -> anyhow::Result<()> {
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["stop", "-f", svc]),
            InitSystem::SysV => self.service(svc, "stop"),
        };
        self.run(cmd).await
    }

    /// Restarts `svc`. On systemd the unit files are reloaded first.
    #[instrument(level = "debug", skip(self))]
    pub async fn restart(&self, svc: &str) -> anyhow::Result<()> {
        let cmd = match self.init {
            InitSystem::Systemd => {
                self.daemon_reload().await?;
                self.systemctl(&["restart", svc])
            }
            InitSystem::SysV => self.service(svc, "restart"),
        };
        self.run(cmd).await
    }

    /// Asks `svc` to reload its configuration.
    pub async fn reload(&self, svc: &str) -> anyhow::Result<()> {
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["reload", svc]),
            InitSystem::SysV => self.service(svc, "reload"),
        };
        self.run(cmd).await
    }

    /// Enables `svc` at boot. Refuses kubelet.
    pub async fn enable(&self, svc: &str) -> anyhow::Result<()> {
        if svc == KUBELET {
            return Err(ServiceError::KubeletEnable.into());
        }
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["enable", svc]),
            InitSystem::SysV => Cmd::new("sudo").args(["update-rc.d", svc, "defaults"]),
        };
        self.run(cmd).await
    }

    /// Enables `svc` at boot and starts it. Refuses kubelet.
    pub async fn enable_now(&self, svc: &str) -> anyhow::Result<()> {
        if svc == KUBELET {
            return Err(ServiceError::KubeletEnable.into());
        }
        match self.init {
            InitSystem::Systemd => self.run(self.systemctl(&["enable", "--now", svc])).await,
            InitSystem::SysV => {
                self.enable(svc).await?;
                self.start(svc).await
            }
        }
    }

    /// Disables `svc` at boot.
    pub async fn disable(&self, svc: &str) -> anyhow::Result<()> {
        let cmd = match self.init {
            InitSystem::Systemd => self.systemctl(&["disable", svc]),
            InitSystem::SysV => Cmd::new("sudo").args(["update-rc.d", svc, "disable"]),
        };
        self.run(cmd).await
    }

    /// Disables `svc` at boot and stops it.
    pub async fn disable_now(&self, svc: &str) -> anyhow::Result<()> {
        match self.init {
            InitSystem::Systemd => self.run(self.systemctl(&["disable", "--now", svc])).await,
            InitSystem::SysV => {
                self.disable(svc).await?;
                self.stop(svc).await
            }
        }
    }

    /// Masks `svc` so nothing can start it. SysV has no equivalent.
    pub async fn mask(&self, svc: &str) -> anyhow::Result<()> {
        match self.init {
            InitSystem::Systemd => self.run(self.systemctl(&["mask", svc])).await,
            InitSystem::SysV => {
                debug!(svc, "mask is a no-op under SysV");
                Ok(())
            }
        }
    }

    /// Reverses [`ServiceManager::mask`].
    pub async fn unmask(&self, svc: &str) -> anyhow::Result<()> {
        match self.init {
            InitSystem::Systemd => self.run(self.systemctl(&["unmask", svc])).await,
            InitSystem::SysV => Ok(()),
        }
    }

    /// Reloads unit files.
    pub async fn daemon_reload(&self) -> anyhow::Result<()> {
        match self.init {
            InitSystem::Systemd => self.run(self.systemctl(&["daemon-reload"])).await,
            InitSystem::SysV => Ok(()),
        }
    }

    /// The unit's sub-state (`running`, `dead`, `failed`, ...). SysV only
    /// distinguishes `running` from `dead`.
    pub async fn sub_state(&self, svc: &str) -> Result<String, RunError> {
        match self.init {
            InitSystem::Systemd => {
                let res = self
                    .runner
                    .run_cmd(self.systemctl(&["show", "-p", "SubState", "--value", svc]))
                    .await?;
                Ok(res.stdout_str().trim().to_string())
            }
            InitSystem::SysV => Ok(if self.active(svc).await {
                "running".to_string()
            } else {
                "dead".to_string()
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::FakeRunner;

    #[tokio::test]
    async fn detects_systemd_and_sysv() {
        let systemd = FakeRunner::new();
        assert_eq!(InitSystem::detect(&systemd).await, InitSystem::Systemd);
        let sysv = FakeRunner::new().with_sysv();
        assert_eq!(InitSystem::detect(&sysv).await, InitSystem::SysV);
    }

    #[tokio::test]
    async fn kubelet_is_never_enabled() {
        let runner = FakeRunner::new();
        let mgr = ServiceManager::new(&runner, InitSystem::Systemd);
        let err = mgr.enable(KUBELET).await.unwrap_err();
        assert_eq!(err.downcast_ref::<ServiceError>(), Some(&ServiceError::KubeletEnable));
        assert!(mgr.enable_now(KUBELET).await.is_err());
        mgr.start(KUBELET).await.expect("starting kubelet is allowed");
        assert!(mgr.active(KUBELET).await);
        assert!(runner.commands().iter().all(|c| !c.contains("enable")));
    }

    #[tokio::test]
    async fn restart_reloads_units_first() {
        let runner = FakeRunner::new();
        let mgr = ServiceManager::new(&runner, InitSystem::Systemd);
        mgr.restart(DOCKER).await.unwrap();
        let cmds = runner.commands();
        assert_eq!(
            cmds,
            vec![
                "sudo systemctl daemon-reload".to_string(),
                "sudo systemctl restart docker".to_string()
            ]
        );
        assert_eq!(runner.restarts(DOCKER), 1);
    }

    #[tokio::test]
    async fn sysv_uses_service_scripts() {
        let runner = FakeRunner::new().with_sysv();
        let mgr = ServiceManager::new(&runner, InitSystem::SysV);
        mgr.start(CRIO).await.unwrap();
        mgr.mask(CRIO).await.unwrap();
        mgr.daemon_reload().await.unwrap();
        assert_eq!(runner.commands(), vec!["sudo service crio start".to_string()]);
        assert!(mgr.active(CRIO).await);
        assert_eq!(mgr.sub_state(CRIO).await.unwrap(), "running");
    }

    #[tokio::test]
    async fn stop_reports_dead_sub_state() {
        let runner = FakeRunner::new();
        let mgr = ServiceManager::new(&runner, InitSystem::Systemd);
        mgr.start(KUBELET).await.unwrap();
        assert_eq!(mgr.sub_state(KUBELET).await.unwrap(), "running");
        mgr.stop(KUBELET).await.unwrap();
        assert_eq!(mgr.sub_state(KUBELET).await.unwrap(), "dead");
        assert!(!mgr.active(KUBELET).await);
    }
}
