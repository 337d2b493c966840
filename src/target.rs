//! iSCSI target server
//!
//! Accepts TCP connections on the configured portal and runs each one on
//! its own thread. Everything the connections share (configuration, LUN
//! matrix, sessions, customizations) lives in [`TargetState`].

use crate::auth::{AuthConfig, SrpAuthenticator};
use crate::command::OwnerId;
use crate::config::{CustomRegistry, Customization, TargetConfig, TargetConfigBuilder};
use crate::connection::handle_connection;
use crate::error::ScsiResult;
use crate::lun::LunMatrix;
use crate::session::SessionRegistry;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// State shared by every connection of a target
pub struct TargetState {
    pub config: Arc<TargetConfig>,
    pub luns: Arc<Mutex<LunMatrix>>,
    pub sessions: Arc<Mutex<SessionRegistry>>,
    pub custom: Arc<CustomRegistry>,
    next_owner: AtomicU64,
    running: AtomicBool,
}

impl TargetState {
    fn new(config: TargetConfig, luns: LunMatrix) -> Self {
        let custom = CustomRegistry::new(config.custom.clone());
        TargetState {
            config: Arc::new(config),
            luns: Arc::new(Mutex::new(luns)),
            sessions: Arc::new(Mutex::new(SessionRegistry::new())),
            custom: Arc::new(custom),
            next_owner: AtomicU64::new(1),
            running: AtomicBool::new(true),
        }
    }

    /// Identifier for a newly accepted connection
    pub fn next_owner(&self) -> OwnerId {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    fn reap_sessions(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            let reaped = sessions.reap(Instant::now());
            if reaped > 0 {
                log::info!("{} idle sessions past DefaultTime2Retain removed", reaped);
            }
        }
    }
}

/// iSCSI target server
pub struct IscsiTarget {
    state: Arc<TargetState>,
}

impl IscsiTarget {
    /// Create a new builder for configuring the target
    pub fn builder() -> IscsiTargetBuilder {
        IscsiTargetBuilder::new()
    }

    /// Target with the default LUN matrix (every LUN in memory)
    pub fn new(config: TargetConfig) -> Self {
        Self::with_luns(config, LunMatrix::new())
    }

    pub fn with_luns(config: TargetConfig, luns: LunMatrix) -> Self {
        IscsiTarget {
            state: Arc::new(TargetState::new(config, luns)),
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.state.config
    }

    pub fn luns(&self) -> Arc<Mutex<LunMatrix>> {
        Arc::clone(&self.state.luns)
    }

    pub fn custom(&self) -> Arc<CustomRegistry> {
        Arc::clone(&self.state.custom)
    }

    /// Run the iSCSI target server
    ///
    /// This blocks the current thread and processes incoming connections.
    pub fn run(self) -> ScsiResult<()> {
        let listener = TcpListener::bind(&self.state.config.bind_addr)?;
        log::info!("iSCSI target starting on {}", listener.local_addr()?);
        log::info!("Target name: {}", self.state.config.target_name);
        serve(listener, self.state);
        Ok(())
    }

    /// Bind and serve on a background thread
    pub fn spawn(self) -> ScsiResult<TargetHandle> {
        let listener = TcpListener::bind(&self.state.config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        log::info!(
            "iSCSI target {} listening on {}",
            self.state.config.target_name,
            local_addr
        );

        let state = Arc::clone(&self.state);
        let thread = thread::Builder::new()
            .name("iscsi-accept".to_string())
            .spawn(move || serve(listener, state))?;

        Ok(TargetHandle {
            local_addr,
            state: self.state,
            thread: Some(thread),
        })
    }
}

fn serve(listener: TcpListener, state: Arc<TargetState>) {
    for stream in listener.incoming() {
        if !state.running.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                state.reap_sessions();
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("TCP_NODELAY not set: {}", e);
                }
                let state = Arc::clone(&state);
                let spawned = thread::Builder::new()
                    .name("iscsi-conn".to_string())
                    .spawn(move || {
                        let _ = handle_connection(stream, state);
                    });
                if let Err(e) = spawned {
                    log::error!("cannot start connection thread: {}", e);
                }
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
    log::info!("iSCSI target stopped accepting connections");
}

/// A target running on a background thread
pub struct TargetHandle {
    local_addr: SocketAddr,
    state: Arc<TargetState>,
    thread: Option<JoinHandle<()>>,
}

impl TargetHandle {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn luns(&self) -> Arc<Mutex<LunMatrix>> {
        Arc::clone(&self.state.luns)
    }

    pub fn custom(&self) -> Arc<CustomRegistry> {
        Arc::clone(&self.state.custom)
    }

    pub fn sessions(&self) -> Arc<Mutex<SessionRegistry>> {
        Arc::clone(&self.state.sessions)
    }

    /// Stop accepting connections and wait for the accept thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        // The accept loop only notices the flag on its next connection
        let _ = TcpStream::connect(wake);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("accept thread panicked");
            }
        }
    }
}

impl Drop for TargetHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

/// Builder for configuring an iSCSI target
#[derive(Default)]
pub struct IscsiTargetBuilder {
    config: TargetConfigBuilder,
    luns: Option<LunMatrix>,
}

impl IscsiTargetBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.config = self.config.bind_addr(addr);
        self
    }

    pub fn port(mut self, port: &str) -> Self {
        self.config = self.config.port(port);
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2004-01.com:target.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.config = self.config.target_name(name);
        self
    }

    pub fn target_alias(mut self, alias: &str) -> Self {
        self.config = self.config.target_alias(alias);
        self
    }

    pub fn portal_group_tag(mut self, tpgt: u16) -> Self {
        self.config = self.config.portal_group_tag(tpgt);
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.config = self.config.auth(auth);
        self
    }

    pub fn srp_authenticator(mut self, srp: Arc<dyn SrpAuthenticator>) -> Self {
        self.config = self.config.srp_authenticator(srp);
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.config = self.config.with_param(name, value);
        self
    }

    pub fn customization(mut self, custom: Customization) -> Self {
        self.config = self.config.customization(custom);
        self
    }

    /// Serve a prepared LUN matrix instead of the default one
    pub fn luns(mut self, luns: LunMatrix) -> Self {
        self.luns = Some(luns);
        self
    }

    pub fn build(self) -> ScsiResult<IscsiTarget> {
        let config = self.config.build()?;
        Ok(IscsiTarget::with_luns(config, self.luns.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IscsiError;

    #[test]
    fn test_builder_rejects_bad_name() {
        let result = IscsiTarget::builder().target_name("not-a-name").build();
        assert!(matches!(result, Err(IscsiError::Config(_))));
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let target = IscsiTarget::builder().bind_addr("127.0.0.1:0").build().unwrap();
        let handle = target.spawn().unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert!(handle.sessions().lock().unwrap().is_empty());
        handle.shutdown();
    }

    #[test]
    fn test_owner_ids_are_unique() {
        let target = IscsiTarget::builder().bind_addr("127.0.0.1:0").build().unwrap();
        let a = target.state.next_owner();
        let b = target.state.next_owner();
        assert_ne!(a, b);
    }
}
