use std::env;

use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: zapcrm serve --config <path>\n       zapcrm replay --config <path> --journal <path>";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" && cmd != "replay" {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    let mut journal_path: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    config_path = v;
                }
            }
            "--journal" => journal_path = args.next(),
            _ => {}
        }
    }

    let cfg = match zapcrm_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.logging.level);

    if cmd == "replay" {
        let Some(journal_path) = journal_path.or_else(|| cfg.journal.failed_events_path.clone())
        else {
            eprintln!("replay needs --journal <path> or journal.failed_events_path in config");
            std::process::exit(2);
        };
        match zapcrm_server::replay_failed_events(cfg, &journal_path).await {
            Ok(summary) => {
                println!(
                    "replayed={} succeeded={} failed={}",
                    summary.replayed, summary.succeeded, summary.failed
                );
                if summary.failed > 0 {
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("replay failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = zapcrm_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over the configured level when set.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "zapcrm={level},zapcrm_server={level},tower_http=warn,warn"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
