//! The append-only transaction journal.
//!
//! One LF terminated line per record, 15 colon separated percent escaped
//! fields.  A new file is opened for each day; because worker threads may
//! write records slightly out of wall-clock order, the file is chosen by
//! the record's own timestamp rather than by write time.
//!
//! A write failure terminates the process: a failure here could cause
//! transactions to be accepted but not logged, and the operator prefers a
//! down service over a lossy one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::error;

use crate::currency::{convert_currency, Rates};
use crate::keyvalue::{percent_escape, Dict};

/// Record type tags.
pub const TYPE_SYNC: char = '-';
pub const TYPE_SYSTEM: char = '$';
pub const TYPE_CHARGE: char = 'C';
pub const TYPE_REFUND: char = 'R';

/// Payment service tags for the `service` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    NotApplicable = 0,
    Stripe = 1,
    Paypal = 2,
    Sepa = 3,
    Manual = 255,
}

/// Number of fields in a journal record.
pub const NFIELDS: usize = 15;

struct LogFile {
    file: Option<File>,
    fullname: PathBuf,
    suffix: String,
}

pub struct Journal {
    /// Base name of the journal files; None disables the journal.
    basename: Option<PathBuf>,
    inner: Mutex<LogFile>,
}

/// Timestamp in the journal's `yyyymmddThhmmss` format (UTC).
pub fn timestamp_now() -> String {
    Utc::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Stop the process as soon as possible; see the module comment.
fn severe_error() -> ! {
    std::process::exit(4);
}

// --- impl Journal --- //

impl Journal {
    pub fn new(basename: Option<PathBuf>) -> Self {
        Self {
            basename,
            inner: Mutex::new(LogFile {
                file: None,
                fullname: PathBuf::new(),
                suffix: String::new(),
            }),
        }
    }

    /// Commit one composed record.  LINE must carry the timestamp in its
    /// first eight characters; it selects the daily file.
    fn write_record(&self, line: &str) {
        let Some(basename) = &self.basename else {
            return; // Journal not enabled.
        };

        let mut lf = self.inner.lock().expect("journal lock");
        let day = &line[..8.min(line.len())];
        if lf.file.is_none() || lf.suffix != day {
            lf.suffix = day.to_string();
            let mut fullname = basename.as_os_str().to_owned();
            fullname.push(format!("-{day}.log"));
            lf.fullname = PathBuf::from(fullname);
            match OpenOptions::new().create(true).append(true).open(&lf.fullname) {
                Ok(file) => lf.file = Some(file),
                Err(err) => {
                    error!("error opening '{}': {}", lf.fullname.display(), err);
                    severe_error();
                }
            }
        }

        let file = lf.file.as_mut().expect("journal file open");
        if file
            .write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .is_err()
        {
            error!("error writing to journal '{}'", lf.fullname.display());
            severe_error();
        }
    }

    /// Store a system record.
    pub fn store_sys_record(&self, text: &str) {
        let ts = timestamp_now();
        let mut fields = [""; NFIELDS];
        let escaped = percent_escape(text);
        fields[0] = &ts;
        fields[1] = "$";
        fields[5] = &escaped;
        self.write_record(&fields.join(":"));
    }

    /// Store a system record for a changed currency exchange rate.
    pub fn store_exchange_rate_record(&self, currency: &str, rate: f64) {
        let ts = timestamp_now();
        let rate = format!("{rate:.6}");
        let mut fields = [""; NFIELDS];
        fields[0] = &ts;
        fields[1] = "$";
        fields[2] = "1";
        fields[3] = currency;
        fields[4] = &rate;
        fields[5] = "new exchange rate";
        fields[14] = "1.0";
        self.write_record(&fields.join(":"));
    }

    /// Store a charge record composed from DICT and note the used
    /// timestamp in DICT as `_timestamp`.  There is no error return: the
    /// transaction has already happened and a record that cannot be
    /// written stops the process.
    pub fn store_charge_record(&self, dict: &mut Dict, service: Service, rates: &Rates) {
        let ts = timestamp_now();
        let line = compose_charge_record(&ts, dict, service, rates);
        dict.put("_timestamp", &ts);
        self.write_record(&line);
    }
}

/// Compose the 15 fields of a charge record.  Factored out of
/// [`Journal::store_charge_record`] so the layout is testable without
/// touching the filesystem.
fn compose_charge_record(ts: &str, dict: &Dict, service: Service, rates: &Rates) -> String {
    let currency = dict.get_str("Currency");
    let amount = dict.get_str("Amount");
    let euro = convert_currency(rates, currency, amount).unwrap_or_default();
    let account = match dict.get("account-id") {
        Some(id) if !id.is_empty() => percent_escape(id),
        _ => "0".to_string(),
    };
    let service = (service as u32).to_string();

    let fields: [String; NFIELDS] = [
        ts.to_string(),
        TYPE_CHARGE.to_string(),
        if dict.get_str("Live") == "t" { "1" } else { "0" }.to_string(),
        percent_escape(currency),
        percent_escape(amount),
        percent_escape(dict.get_str("Desc")),
        percent_escape(dict.get_str("Email")),
        dict.meta_to_string().unwrap_or_default(),
        percent_escape(dict.get_str("Last4")),
        service,
        account,
        percent_escape(dict.get_str("Charge-Id")),
        percent_escape(dict.get_str("balance-transaction")),
        String::new(), // rtxid, used by refunds only
        euro,
    ];
    fields.join(":")
}

#[cfg(test)]
mod tests {
    use crate::keyvalue::percent_unescape;

    use super::*;

    fn sample_dict() -> Dict {
        let mut dict = Dict::new();
        dict.put("Live", "f");
        dict.put("Currency", "EUR");
        dict.put("Amount", "10.42");
        dict.put("Desc", "test: donation");
        dict.put("Email", "donor@example.org");
        dict.put("Meta[Origin]", "web form");
        dict.put("Last4", "4242");
        dict.put("Charge-Id", "ch_123");
        dict.put("balance-transaction", "txn_456");
        dict
    }

    // P8: every record has exactly 15 fields after unescaping.
    #[test]
    fn charge_record_has_fifteen_fields() {
        let rates = Rates::new();
        let dict = sample_dict();
        let line = compose_charge_record("20140919T153301", &dict, Service::Stripe, &rates);
        let fields: Vec<String> = line.split(':').map(percent_unescape).collect();
        assert_eq!(fields.len(), NFIELDS);
        assert_eq!(fields[0], "20140919T153301");
        assert_eq!(fields[1], "C");
        assert_eq!(fields[2], "0");
        assert_eq!(fields[3], "EUR");
        assert_eq!(fields[4], "10.42");
        assert_eq!(fields[5], "test: donation");
        assert_eq!(fields[6], "donor@example.org");
        assert_eq!(percent_unescape(&fields[7]), "Origin=web form");
        assert_eq!(fields[8], "4242");
        assert_eq!(fields[9], "1");
        assert_eq!(fields[10], "0");
        assert_eq!(fields[11], "ch_123");
        assert_eq!(fields[12], "txn_456");
        assert_eq!(fields[13], "");
        assert_eq!(fields[14], "10.42"); // EUR converts 1:1
    }

    #[test]
    fn field_escaping_keeps_colons_out() {
        let rates = Rates::new();
        let mut dict = sample_dict();
        dict.put("Desc", "a:b\nc&d%e");
        let line = compose_charge_record("20140919T153301", &dict, Service::Sepa, &rates);
        assert_eq!(line.split(':').count(), NFIELDS);
        let desc = line.split(':').nth(5).unwrap().to_string();
        assert_eq!(percent_unescape(&desc), "a:b\nc&d%e");
    }

    #[test]
    fn rotation_uses_record_timestamp() {
        let dir = std::env::temp_dir().join(format!("payproc-jrnl-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let journal = Journal::new(Some(dir.join("journal")));

        // Two records on different days land in different files.
        journal.write_record("20140919T153301:$:::::::::::::");
        journal.write_record("20140920T000001:$:::::::::::::");
        assert!(dir.join("journal-20140919.log").exists());
        assert!(dir.join("journal-20140920.log").exists());

        let data = std::fs::read_to_string(dir.join("journal-20140919.log")).unwrap();
        assert_eq!(data, "20140919T153301:$:::::::::::::\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn disabled_journal_is_a_noop() {
        let journal = Journal::new(None);
        journal.store_sys_record("started");
    }
}
