//! Command line interface and configuration.
//!
//! There is no config file; everything arrives as flags and secret keys
//! are read from files named on the command line.  The daemon runs in the
//! foreground under a supervisor.

use std::path::PathBuf;

use anyhow::{bail, Context};
use argh::FromArgs;
use tracing::info;

/// the payment processing daemon
#[derive(Debug, FromArgs)]
pub struct Args {
    /// enable live mode
    #[argh(switch)]
    pub live: bool,

    /// enable test mode (the default)
    #[argh(switch)]
    pub test: bool,

    /// verbose operation
    #[argh(switch, short = 'v')]
    pub verbose: bool,

    /// path of the listening socket. Defaults to the per-mode run
    /// directory
    #[argh(option)]
    pub socket: Option<PathBuf>,

    /// write the journal to FILE; a daily date suffix is appended
    #[argh(option)]
    pub journal: Option<PathBuf>,

    /// allow access from this uid; repeatable. Without any, all users
    /// are allowed
    #[argh(option)]
    pub allow_uid: Vec<u32>,

    /// allow admin access from this uid; repeatable. Implies --allow-uid
    #[argh(option)]
    pub admin_uid: Vec<u32>,

    /// read the Stripe secret key from FILE
    #[argh(option)]
    pub stripe_key: Option<PathBuf>,

    /// read the PayPal client_id:secret pair from FILE
    #[argh(option)]
    pub paypal_key: Option<PathBuf>,

    /// fingerprint of the OpenPGP key encrypting database columns
    #[argh(option)]
    pub database_key: Option<String>,

    /// fingerprint of the backoffice OpenPGP key
    #[argh(option)]
    pub backoffice_key: Option<String>,

    /// mailbox expected as receiver_email of a PayPal IPN
    #[argh(option)]
    pub paypal_mailbox: Option<String>,

    /// file of the preorder database
    #[argh(option)]
    pub preorder_db: Option<PathBuf>,

    /// file of the account database
    #[argh(option)]
    pub account_db: Option<PathBuf>,

    /// file with the Euro exchange rates
    #[argh(option)]
    pub rates_file: Option<PathBuf>,

    /// debug I/O with the client
    #[argh(switch)]
    pub debug_client: bool,

    /// debug the Stripe REST calls
    #[argh(switch)]
    pub debug_stripe: bool,

    /// debug the PayPal REST calls
    #[argh(switch)]
    pub debug_paypal: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub livemode: bool,
    pub verbose: bool,
    pub socket_path: PathBuf,
    pub journal_path: Option<PathBuf>,
    pub preorder_db: PathBuf,
    pub account_db: PathBuf,
    pub rates_file: PathBuf,
    pub allowed_uids: Vec<u32>,
    pub admin_uids: Vec<u32>,
    pub stripe_secret_key: Option<String>,
    pub paypal_secret_key: Option<String>,
    pub database_key: Option<String>,
    pub backoffice_key: Option<String>,
    pub paypal_mailbox: String,
    pub debug_client: bool,
    pub debug_stripe: bool,
    pub debug_paypal: bool,
}

impl Default for Config {
    /// Test-mode defaults; [`Config::from_args`] overrides from the
    /// command line.
    fn default() -> Self {
        Self {
            livemode: false,
            verbose: false,
            socket_path: PathBuf::from("/var/run/payproc-test/daemon"),
            journal_path: None,
            preorder_db: PathBuf::from("/var/lib/payproc-test/preorder.db"),
            account_db: PathBuf::from("/var/lib/payproc-test/account.db"),
            rates_file: PathBuf::from("/var/lib/payproc/euroxref.dat"),
            allowed_uids: Vec::new(),
            admin_uids: Vec::new(),
            stripe_secret_key: None,
            paypal_secret_key: None,
            database_key: None,
            backoffice_key: None,
            paypal_mailbox: "paypal-test@g10code.com".to_string(),
            debug_client: false,
            debug_stripe: false,
            debug_paypal: false,
        }
    }
}

/// Read the first line of a key file.
fn read_key_file(path: &PathBuf) -> anyhow::Result<String> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("error opening key file '{}'", path.display()))?;
    Ok(data.lines().next().unwrap_or("").trim().to_string())
}

impl Config {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let livemode = args.live && !args.test;
        if !args.live && !args.test {
            info!("implicitly using --test");
        }

        let mut cfg = Config { livemode, ..Config::default() };
        cfg.verbose = args.verbose;
        cfg.debug_client = args.debug_client;
        cfg.debug_stripe = args.debug_stripe;
        cfg.debug_paypal = args.debug_paypal;

        if livemode {
            cfg.socket_path = PathBuf::from("/var/run/payproc/daemon");
            cfg.preorder_db = PathBuf::from("/var/lib/payproc/preorder.db");
            cfg.account_db = PathBuf::from("/var/lib/payproc/account.db");
        }
        if let Some(socket) = &args.socket {
            cfg.socket_path = socket.clone();
        }
        cfg.journal_path = args.journal.clone();
        if let Some(path) = &args.preorder_db {
            cfg.preorder_db = path.clone();
        }
        if let Some(path) = &args.account_db {
            cfg.account_db = path.clone();
        }
        if let Some(path) = &args.rates_file {
            cfg.rates_file = path.clone();
        }
        if let Some(mailbox) = &args.paypal_mailbox {
            cfg.paypal_mailbox = mailbox.clone();
        }

        // Admin users are implicitly allowed users.
        cfg.allowed_uids = args.allow_uid.clone();
        cfg.admin_uids = args.admin_uid.clone();
        for uid in &cfg.admin_uids {
            if !cfg.allowed_uids.contains(uid) {
                cfg.allowed_uids.push(*uid);
            }
        }

        if let Some(path) = &args.stripe_key {
            let key = read_key_file(path)?;
            if !key.starts_with("sk_test_") && !key.starts_with("sk_live_") {
                bail!(
                    "file '{}' seems not to carry a Stripe secret key",
                    path.display()
                );
            }
            cfg.stripe_secret_key = Some(key);
        }
        if let Some(path) = &args.paypal_key {
            let key = read_key_file(path)?;
            if !key.contains(':') && key.len() != 121 {
                bail!(
                    "file '{}' seems not to carry a PayPal secret key",
                    path.display()
                );
            }
            cfg.paypal_secret_key = Some(key);
        }

        // A live daemon must not run with a test key and vice versa.
        match &cfg.stripe_secret_key {
            Some(key) if cfg.livemode && !key.starts_with("sk_live_") => {
                bail!("live mode requested but no live key given");
            }
            Some(key) if !cfg.livemode && key.starts_with("sk_live_") => {
                bail!("test mode requested but live key given");
            }
            None if cfg.livemode => bail!("live mode requested but no live key given"),
            _ => {}
        }

        cfg.database_key = args.database_key.clone();
        cfg.backoffice_key = args.backoffice_key.clone();
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            live: false,
            test: true,
            verbose: false,
            socket: None,
            journal: None,
            allow_uid: vec![],
            admin_uid: vec![],
            stripe_key: None,
            paypal_key: None,
            database_key: None,
            backoffice_key: None,
            paypal_mailbox: None,
            preorder_db: None,
            account_db: None,
            rates_file: None,
            debug_client: false,
            debug_stripe: false,
            debug_paypal: false,
        }
    }

    #[test]
    fn admin_uids_are_allowed_uids() {
        let mut args = base_args();
        args.allow_uid = vec![100];
        args.admin_uid = vec![200];
        let cfg = Config::from_args(&args).unwrap();
        assert_eq!(cfg.allowed_uids, vec![100, 200]);
        assert_eq!(cfg.admin_uids, vec![200]);
    }

    #[test]
    fn live_mode_needs_a_live_key() {
        let mut args = base_args();
        args.live = true;
        args.test = false;
        assert!(Config::from_args(&args).is_err());
    }

    #[test]
    fn key_files_are_checked() {
        let dir = std::env::temp_dir().join(format!("payproc-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let keyfile = dir.join("stripe.key");
        std::fs::write(&keyfile, "not-a-key\n").unwrap();

        let mut args = base_args();
        args.stripe_key = Some(keyfile.clone());
        assert!(Config::from_args(&args).is_err());

        std::fs::write(&keyfile, "sk_test_abc123\n").unwrap();
        let cfg = Config::from_args(&args).unwrap();
        assert_eq!(cfg.stripe_secret_key.as_deref(), Some("sk_test_abc123"));

        // A live key in test mode is refused.
        std::fs::write(&keyfile, "sk_live_abc123\n").unwrap();
        assert!(Config::from_args(&args).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
