//! iSCSI target with in-memory and file-mapped LUNs
//!
//! Usage: `cargo run --example in_memory_target [config.toml]`
//!
//! Without a config file every LUN of target 0 is a 4 MiB in-memory disk
//! served on 0.0.0.0:3260. A config file may set:
//!
//! ```toml
//! [target]
//! bind = "0.0.0.0"
//! port = "iscsi-target"
//! name = "iqn.2004-01.com:target"
//! alias = "demo"
//! verbosity = "verbose"
//!
//! [chap]
//! user = "initiator-user"
//! secret = "verysecret12"
//!
//! [[lun]]
//! target = 0
//! lun = 1
//! file = "/var/tmp/disk1.img"
//!
//! [custom]
//! split_pdu_at = "512"
//! ```

use iscsi_target::config::Verbosity;
use iscsi_target::{AuthConfig, ChapCredentials, Customization, IscsiTarget, LunMatrix};
use std::error::Error;

fn text<'a>(table: Option<&'a toml::Value>, key: &str) -> Option<&'a str> {
    table.and_then(|t| t.get(key)).and_then(|v| v.as_str())
}

fn main() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)?.parse::<toml::Value>()?,
        None => toml::Value::Table(Default::default()),
    };
    let target = config.get("target");

    let verbosity: Verbosity = text(target, "verbosity").unwrap_or("normal").parse()?;
    env_logger::Builder::new()
        .filter_level(verbosity.level_filter())
        .parse_default_env()
        .init();

    let mut luns = LunMatrix::new();
    if let Some(entries) = config.get("lun").and_then(|l| l.as_array()) {
        for entry in entries {
            let index = |key: &str| entry.get(key).and_then(|v| v.as_integer()).unwrap_or(0) as usize;
            let Some(file) = entry.get("file").and_then(|v| v.as_str()) else {
                continue;
            };
            luns.mmap_device(index("target"), index("lun"), file)?;
            println!("target {} LUN {} -> {}", index("target"), index("lun"), file);
        }
    }

    let mut custom = Customization::default();
    if let Some(table) = config.get("custom").and_then(|c| c.as_table()) {
        for (name, value) in table {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            custom.set(name, &value)?;
        }
    }

    let mut builder = IscsiTarget::builder()
        .bind_addr(text(target, "bind").unwrap_or("0.0.0.0"))
        .port(text(target, "port").unwrap_or("iscsi-target"))
        .target_name(text(target, "name").unwrap_or("iqn.2004-01.com:target"))
        .customization(custom)
        .luns(luns);
    if let Some(alias) = text(target, "alias") {
        builder = builder.target_alias(alias);
    }
    let chap = config.get("chap");
    if let (Some(user), Some(secret)) = (text(chap, "user"), text(chap, "secret")) {
        builder = builder.auth(AuthConfig::Chap {
            credentials: ChapCredentials::new(user, secret),
        });
    }

    let target = builder.build()?;
    println!("iSCSI target configured:");
    println!("  Target name: {}", target.config().target_name);
    println!("  Listen address: {}", target.config().bind_addr);

    target.run()?;
    Ok(())
}
