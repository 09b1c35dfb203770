mod server;

use rmcp::ServiceExt;
use sav_core::{config_dir, read_settings_in, write_settings_in, ConsoleSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use server::SavServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("config") {
        return configure(&args[1..]);
    }

    init_tracing();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting sav-mcp");

    let service = SavServer::new()
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "MCP server error"))?;
    service.waiting().await?;
    Ok(())
}

/// Logs go to stderr; stdout carries the MCP protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sav=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();
}

/// `sav-mcp config api_base=https://... whatsapp_number=...`
///
/// Without arguments, prints the stored settings.
fn configure(pairs: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let dir = config_dir();
    let mut settings = read_settings_in(&dir);
    if pairs.is_empty() {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", pair))?;
        apply_setting(&mut settings, key.trim(), value.trim())?;
    }
    write_settings_in(&dir, &settings)?;
    eprintln!("Wrote {}", dir.join("settings.json").display());
    Ok(())
}

fn apply_setting(settings: &mut ConsoleSettings, key: &str, value: &str) -> Result<(), String> {
    let slot = match key {
        "api_base" => &mut settings.api_base,
        "webhook_base" => &mut settings.webhook_base,
        "whatsapp_number" => &mut settings.whatsapp_number,
        "public_base" => &mut settings.public_base,
        other => {
            return Err(format!(
                "unknown setting '{}' (expected api_base, webhook_base, whatsapp_number or public_base)",
                other
            ))
        }
    };
    *slot = value.to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn settings_are_set_by_key() {
        let mut settings = ConsoleSettings::default();
        apply_setting(&mut settings, "api_base", "https://api.test").unwrap();
        apply_setting(&mut settings, "whatsapp_number", "+33 6 12").unwrap();
        assert_eq!(settings.api_base, "https://api.test");
        assert_eq!(settings.whatsapp_number, "+33 6 12");
        assert_eq!(settings.public_base, "");
    }

    #[test]
    fn unknown_setting_is_rejected() {
        let mut settings = ConsoleSettings::default();
        let err = apply_setting(&mut settings, "token", "x").unwrap_err();
        assert!(err.contains("unknown setting 'token'"));
        assert_eq!(settings, ConsoleSettings::default());
    }
}
