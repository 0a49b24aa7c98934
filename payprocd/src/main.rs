use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use payprocd::cli::{Args, Config};
use payprocd::context::Daemon;
use payprocd::server;

fn main() {
    let args: Args = argh::from_env();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(err) = run(args) {
        eprintln!("payprocd: {err:#}");
        std::process::exit(2);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let cfg = Config::from_args(&args)?;
    let version = env!("CARGO_PKG_VERSION");

    if cfg.verbose {
        info!("Mode .........: {}", if cfg.livemode { "live" } else { "test" });
        info!("Stripe key ...: {}", if cfg.stripe_secret_key.is_some() { "yes" } else { "no" });
        info!("Paypal key ...: {}", if cfg.paypal_secret_key.is_some() { "yes" } else { "no" });
        let users = cfg
            .allowed_uids
            .iter()
            .map(|uid| {
                let star = if cfg.admin_uids.contains(uid) { "*" } else { "" };
                format!("{uid}{star}")
            })
            .collect::<Vec<_>>()
            .join(" ");
        info!("Allowed users : {users}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(async {
        let ctx: Arc<Daemon> = Daemon::new(cfg)?;

        info!("payprocd {version} started");
        ctx.journal.store_sys_record(&format!("payprocd {version} started"));
        ctx.rates.reload(&ctx.cfg.rates_file, &ctx.journal);

        server::run(ctx.clone()).await?;

        ctx.journal.store_sys_record(&format!("payprocd {version} stopped"));
        info!("payprocd {version} stopped");
        std::fs::remove_file(&ctx.cfg.socket_path).ok();
        Ok(())
    })
}
