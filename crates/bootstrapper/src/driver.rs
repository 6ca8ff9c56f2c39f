//! The machine driver capability the bootstrapper consumes.
//!
//! Drivers create and remove the host and say how to reach it; everything
//! else about them is opaque here.

use std::path::PathBuf;

use async_trait::async_trait;
use command_runner::{SshClient, SshRunner, SshTarget};

/// Drivers that run the node inside a container.
pub const KIC_DRIVERS: &[&str] = &["docker", "podman"];

/// The driver that provisions the machine running the bootstrapper.
pub const NONE_DRIVER: &str = "none";

/// Whether `driver` runs nodes in containers.
pub fn is_kic(driver: &str) -> bool {
    KIC_DRIVERS.contains(&driver)
}

/// Whether `driver` provisions this machine directly.
pub fn is_none(driver: &str) -> bool {
    driver == NONE_DRIVER
}

/// What a machine driver must offer.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Creates the machine.
    async fn create(&self) -> anyhow::Result<()>;
    /// Removes the machine.
    async fn remove(&self) -> anyhow::Result<()>;
    /// Private key for SSH.
    fn ssh_key_path(&self) -> PathBuf;
    /// Host to SSH to.
    fn ssh_hostname(&self) -> anyhow::Result<String>;
    /// Port sshd listens on.
    fn ssh_port(&self) -> anyhow::Result<u16>;
    /// The machine's IP.
    fn ip(&self) -> anyhow::Result<String>;
    /// The SSH login user.
    fn ssh_username(&self) -> String {
        "docker".to_string()
    }
}

/// Builds an SSH runner for a driver's machine.
pub fn ssh_runner(driver: &dyn Driver) -> anyhow::Result<SshRunner> {
    let target = SshTarget {
        host: driver.ssh_hostname()?,
        port: driver.ssh_port()?,
        user: driver.ssh_username(),
        key_path: driver.ssh_key_path(),
    };
    Ok(SshRunner::new(std::sync::Arc::new(SshClient::new(target))))
}

/// A machine that already exists, described by flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistingMachine {
    /// Address.
    pub ip: String,
    /// sshd port.
    pub ssh_port: u16,
    /// Login user.
    pub ssh_user: String,
    /// Private key.
    pub ssh_key: PathBuf,
}

#[async_trait]
impl Driver for ExistingMachine {
    async fn create(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.ssh_key.clone()
    }

    fn ssh_hostname(&self) -> anyhow::Result<String> {
        Ok(self.ip.clone())
    }

    fn ssh_port(&self) -> anyhow::Result<u16> {
        Ok(self.ssh_port)
    }

    fn ip(&self) -> anyhow::Result<String> {
        Ok(self.ip.clone())
    }

    fn ssh_username(&self) -> String {
        self.ssh_user.clone()
    }
}
