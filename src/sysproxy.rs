//! OS-level system proxy toggling
//!
//! Only macOS has an implementation (`networksetup`); every other platform
//! gets [`NoopSystemProxy`].

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Points the OS at (and away from) the local listener
#[async_trait]
pub trait SystemProxy: Send + Sync {
    async fn enable(&self, bypass: &[String], listen: SocketAddr) -> Result<()>;

    async fn disable(&self) -> Result<()>;
}

/// Leaves the OS configuration untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSystemProxy;

#[async_trait]
impl SystemProxy for NoopSystemProxy {
    async fn enable(&self, _bypass: &[String], listen: SocketAddr) -> Result<()> {
        debug!("System proxy not managed on this platform (listening on {})", listen);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        Ok(())
    }
}

/// Best implementation for the current platform
pub fn platform_default() -> Box<dyn SystemProxy> {
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::NetworkSetup::default())
    }
    #[cfg(not(target_os = "macos"))]
    {
        Box::new(NoopSystemProxy)
    }
}

#[cfg(target_os = "macos")]
pub use macos::NetworkSetup;

#[cfg(target_os = "macos")]
mod macos {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use tokio::process::Command;
    use tracing::{info, warn};

    use crate::error::{Error, Result};

    use super::SystemProxy;

    /// Drives `networksetup` for every enabled network service
    #[derive(Debug, Default)]
    pub struct NetworkSetup;

    async fn networksetup(args: &[&str]) -> Result<String> {
        let output = Command::new("networksetup").args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Config(format!(
                "networksetup {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Enabled services; disabled ones are prefixed with `*`
    async fn services() -> Result<Vec<String>> {
        let listing = networksetup(&["-listallnetworkservices"]).await?;
        Ok(listing
            .lines()
            .skip(1)
            .filter(|line| !line.is_empty() && !line.starts_with('*'))
            .map(str::to_string)
            .collect())
    }

    #[async_trait]
    impl SystemProxy for NetworkSetup {
        async fn enable(&self, bypass: &[String], listen: SocketAddr) -> Result<()> {
            let host = listen.ip().to_string();
            let port = listen.port().to_string();

            for service in services().await? {
                let svc = service.as_str();
                for kind in ["-setwebproxy", "-setsecurewebproxy", "-setsocksfirewallproxy"] {
                    if let Err(e) = networksetup(&[kind, svc, host.as_str(), port.as_str()]).await {
                        warn!("{}", e);
                    }
                }
                if !bypass.is_empty() {
                    let mut args = vec!["-setproxybypassdomains", svc];
                    args.extend(bypass.iter().map(String::as_str));
                    if let Err(e) = networksetup(&args).await {
                        warn!("{}", e);
                    }
                }
                info!("System proxy enabled for {}", service);
            }
            Ok(())
        }

        async fn disable(&self) -> Result<()> {
            for service in services().await? {
                let svc = service.as_str();
                for kind in [
                    "-setwebproxystate",
                    "-setsecurewebproxystate",
                    "-setsocksfirewallproxystate",
                ] {
                    if let Err(e) = networksetup(&[kind, svc, "off"]).await {
                        warn!("{}", e);
                    }
                }
                info!("System proxy disabled for {}", service);
            }
            Ok(())
        }
    }
}

/// Enable `proxy` if configured, logging instead of failing
pub async fn enable_logged(proxy: &dyn SystemProxy, bypass: &[String], listen: SocketAddr) {
    match proxy.enable(bypass, listen).await {
        Ok(()) => info!("System proxy points at {}", listen),
        Err(e) => warn!("Failed to enable system proxy: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_proxy() {
        let proxy = NoopSystemProxy;
        proxy
            .enable(&["127.0.0.1".into()], "127.0.0.1:1080".parse().unwrap())
            .await
            .unwrap();
        proxy.disable().await.unwrap();
    }
}
