//! The daemon context: every shared subsystem, owned in one place.
//!
//! All global mutable state of the C generation of this daemon (session
//! table, journal handle, database handles, token cache) lives here as an
//! owned object created at startup and passed around as `Arc<Daemon>`.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tracing::info;

use crate::account::AccountDb;
use crate::cli::Config;
use crate::currency::Rates;
use crate::encrypt::{Encrypt, GpgEncryptor, PlainEncryptor};
use crate::journal::Journal;
use crate::paypal::PaypalClient;
use crate::preorder::PreorderDb;
use crate::session::SessionStore;
use crate::shutdown::ShutdownSignal;
use crate::stripe::StripeClient;

/// Housekeeping runs every four timer ticks; the exchange rates are
/// reloaded about once an hour.
const RATE_RELOAD_EVERY: u32 = 3600 / 120;

/// Cap on concurrently processed IPN verifications.
const MAX_PENDING_IPN: usize = 16;

pub struct Daemon {
    pub cfg: Config,
    pub sessions: SessionStore,
    pub journal: Journal,
    pub preorders: PreorderDb,
    pub accounts: AccountDb,
    pub rates: Rates,
    pub stripe: StripeClient,
    pub paypal: PaypalClient,
    pub shutdown: ShutdownSignal,
    pub active_connections: AtomicUsize,
    /// Signalled whenever a connection worker finishes; the accept loop
    /// waits on this while draining.
    pub conn_done: Notify,
    pub ipn_slots: Semaphore,
    conn_counter: AtomicU64,
    housekeeping_runs: AtomicU32,
}

// --- impl Daemon --- //

impl Daemon {
    /// Open all stores and gateways per the configuration.
    pub fn new(cfg: Config) -> anyhow::Result<Arc<Self>> {
        let encryptor: Arc<dyn Encrypt> = match &cfg.database_key {
            Some(fpr) => Arc::new(GpgEncryptor::new(
                fpr.clone(),
                cfg.backoffice_key.clone(),
            )),
            None => Arc::new(PlainEncryptor::new()),
        };

        let preorders = PreorderDb::open(&cfg.preorder_db)?;
        let accounts = AccountDb::open(&cfg.account_db, encryptor)?;
        let stripe = StripeClient::new(
            cfg.stripe_secret_key.clone().unwrap_or_default(),
            cfg.debug_stripe,
        );
        let paypal = PaypalClient::new(
            cfg.paypal_secret_key.as_deref().unwrap_or(""),
            cfg.livemode,
            cfg.debug_paypal,
        );
        Ok(Self::assemble(cfg, preorders, accounts, stripe, paypal))
    }

    /// Assemble a context from prebuilt parts.  Tests use this with
    /// in-memory databases and mock gateway endpoints.
    pub fn assemble(
        cfg: Config,
        preorders: PreorderDb,
        accounts: AccountDb,
        stripe: StripeClient,
        paypal: PaypalClient,
    ) -> Arc<Self> {
        let journal = Journal::new(cfg.journal_path.clone());
        Arc::new(Self {
            cfg,
            sessions: SessionStore::new(),
            journal,
            preorders,
            accounts,
            rates: Rates::new(),
            stripe,
            paypal,
            shutdown: ShutdownSignal::new(),
            active_connections: AtomicUsize::new(0),
            conn_done: Notify::new(),
            ipn_slots: Semaphore::new(MAX_PENDING_IPN),
            conn_counter: AtomicU64::new(0),
            housekeeping_runs: AtomicU32::new(0),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Periodic housekeeping: sweep expired sessions, and once per hour
    /// reload the exchange rates.
    pub fn housekeeping(&self) {
        if self.cfg.verbose {
            info!("starting housekeeping");
        }
        self.sessions.housekeeping();

        let runs = self.housekeeping_runs.fetch_add(1, Ordering::Relaxed) + 1;
        if runs >= RATE_RELOAD_EVERY {
            self.housekeeping_runs.store(0, Ordering::Relaxed);
            self.rates.reload(&self.cfg.rates_file, &self.journal);
        }
        if self.cfg.verbose {
            info!("finished with housekeeping");
        }
    }
}
