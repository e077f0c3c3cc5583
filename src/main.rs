use anyhow::{bail, Context, Error};
use clap::Parser;
use clap_stdin::MaybeStdin;
use mdoc_proximity::config::ChunkMarkers;
use mdoc_proximity::definitions::{device_engagement, helpers::Tag24, DeviceEngagement};
use mdoc_proximity::transport::chunk;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Print the BLE options and identity value of a device engagement.
    Engagement {
        /// Device engagement URI, starting with `mdoc:`.
        qr_code_uri: MaybeStdin<String>,
    },
    /// Print the chunks a message is split into.
    Chunk {
        /// Size of one characteristic write, marker included.
        #[arg(long, default_value_t = 20)]
        size: usize,
        /// Hex encoded message.
        payload: MaybeStdin<String>,
    },
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let output = match Args::parse().action {
        Action::Engagement { qr_code_uri } => describe_engagement(qr_code_uri.trim())?,
        Action::Chunk { size, payload } => describe_chunks(size, payload.trim())?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn describe_engagement(qr_code_uri: &str) -> Result<serde_json::Value, Error> {
    let engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(qr_code_uri)
        .context("could not decode device engagement")?;
    let ident = device_engagement::ble_ident(engagement.as_ref().e_device_key())
        .context("could not derive BLE identity")?;
    let ble = engagement
        .as_ref()
        .ble_options()
        .context("engagement offers no BLE retrieval method")?;
    let mut modes = Vec::new();
    if let Some(mode) = &ble.peripheral_server_mode {
        modes.push(json!({ "topology": "peripheral_server_mode", "uuid": mode.uuid }));
    }
    if let Some(mode) = &ble.central_client_mode {
        modes.push(json!({ "topology": "central_client_mode", "uuid": mode.uuid }));
    }
    Ok(json!({
        "version": engagement.as_ref().version,
        "modes": modes,
        "ble_ident": hex::encode(ident),
    }))
}

fn describe_chunks(size: usize, payload: &str) -> Result<serde_json::Value, Error> {
    if size < 2 {
        bail!("chunk size must leave room for the marker byte");
    }
    let payload = hex::decode(payload).context("payload is not hex")?;
    let chunks = chunk::split(&payload, size - 1, ChunkMarkers::default())?;
    Ok(json!(chunks.iter().map(hex::encode).collect::<Vec<_>>()))
}
