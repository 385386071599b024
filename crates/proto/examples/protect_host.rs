//! Host Protection Example
//!
//! Walks one session through its whole life against the in-process kernel
//! tables: install policies, install a negotiated child, dump both tables,
//! then tear everything down.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example protect_host --features ipsec -- [local_addr] [remote_addr]
//! ```
//!
//! # Example
//!
//! ```bash
//! RUST_LOG=debug cargo run --example protect_host --features ipsec -- 192.168.1.1 192.168.1.2
//! ```

use keel_platform::SecurityModule;
use keel_proto::ipsec::{
    CipherId, CipherKey, IntegrityId, IntegrityKey, IpProtocol, IpsecProtocol, MemoryKernel,
    Mode, NegotiatedChild, ProtectRule, SessionConfig, SessionManager, SpiPair,
    TrafficSelector,
};
use rand::RngCore;
use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let local: IpAddr = args.get(1).map_or("192.168.1.1", String::as_str).parse()?;
    let remote: IpAddr = args.get(2).map_or("192.168.1.2", String::as_str).parse()?;

    println!("Host Protection Example");
    println!("=======================");
    println!("Local:  {}", local);
    println!("Remote: {}", remote);
    println!();

    let kernel = Arc::new(MemoryKernel::new());
    let config = SessionConfig::builder()
        .with_kernel_timeout(Duration::from_secs(2))
        .build()?;
    let mut manager = SessionManager::new(kernel.clone(), config);
    manager.init()?;

    // Protect HTTP towards the peer with ESP in transport mode
    let rule = ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Tcp, 0, 80)?;
    let mut session = manager.open(local, remote, vec![rule])?;
    session.install_policies()?;
    println!("[1/3] Policies installed ({})", session.state());

    // Keys would come from the key exchange; random bytes stand in here
    let mut rng = rand::thread_rng();
    let mut cipher_key = vec![0u8; CipherId::AesCbc256.key_len()];
    let mut integrity_key = vec![0u8; IntegrityId::HmacSha256_128.key_len()];
    rng.fill_bytes(&mut cipher_key);
    rng.fill_bytes(&mut integrity_key);

    let spis = SpiPair {
        inbound: manager.associations().allocate_spi(local, IpsecProtocol::Esp)?,
        outbound: manager.associations().allocate_spi(remote, IpsecProtocol::Esp)?,
    };
    let child = NegotiatedChild {
        protocol: IpsecProtocol::Esp,
        mode: Mode::Transport,
        spis,
        cipher: Some(CipherKey::new(CipherId::AesCbc256, cipher_key)),
        integrity: Some(IntegrityKey::new(IntegrityId::HmacSha256_128, integrity_key)),
        local_selector: TrafficSelector::host(local, IpProtocol::Tcp, 0)?,
        remote_selector: TrafficSelector::host(remote, IpProtocol::Tcp, 80)?,
    };
    session.install_child(&child)?;
    println!("[2/3] Child installed ({})", session.state());
    println!();

    println!("Security Policy Database:");
    for policy in kernel.policies() {
        println!("  {}", policy);
    }
    println!("Security Association Database:");
    for sa in kernel.sas() {
        println!("  {}", sa);
    }
    println!();

    session.teardown()?;
    println!("[3/3] Torn down ({})", session.state());

    let snapshot = manager.metrics().snapshot();
    println!();
    println!("Policies installed: {}", snapshot.policies_installed);
    println!("SAs installed:      {}", snapshot.sas_installed);
    println!("Kernel errors:      {}", snapshot.kernel_errors);

    manager.shutdown()?;
    Ok(())
}
