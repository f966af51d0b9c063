/// Commission a device on the local network.
///
/// Creates a CA in ./pem on first run (remove the directory to start a
/// fresh fabric), then commissions the device at the given address:
///
///   cargo run --example commission -- 192.168.1.70 20202021
///   cargo run --example commission -- 192.168.1.70:5540 MT:Y.K9042C00KA0648G00
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use matcom::certstore::{CertStore, FileCertStore};
use matcom::commission::DEVICE_PORT;
use matcom::{onboarding, Commissioner};

const FABRIC_ID: u64 = 0x1000;
const CONTROLLER_ID: u64 = 100;
const DEVICE_ID: u64 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let (Some(device), Some(code)) = (args.next(), args.next()) else {
        eprintln!("usage: commission <device-ip:port> <passcode | MT:payload>");
        std::process::exit(2);
    };
    let device: SocketAddr = match device.parse() {
        Ok(addr) => addr,
        Err(_) => SocketAddr::new(device.parse()?, DEVICE_PORT),
    };
    let passcode = if code.starts_with("MT:") {
        onboarding::decode_qr_text(&code)?.passcode
    } else {
        code.parse()?
    };

    let store: Arc<dyn CertStore> = if std::path::Path::new("./pem").exists() {
        FileCertStore::load("./pem")?
    } else {
        let store = FileCertStore::new(FABRIC_ID, "./pem");
        store.bootstrap()?;
        store.create_controller(CONTROLLER_ID)?;
        store
    };

    let commissioner = Commissioner::new(store)?;
    let channel = commissioner
        .commission(device, passcode, CONTROLLER_ID, DEVICE_ID)
        .await?;
    println!(
        "device commissioned; operational session id {}",
        channel.session_id()
    );
    channel.close().await;
    Ok(())
}
