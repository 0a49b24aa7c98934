//! Supported currencies, amount conversion and Euro exchange rates.
//!
//! Amounts travel through the protocol as decimal strings ("10.42") and
//! through the gateways as integers in the smallest currency unit (1042).
//! The exchange-rate table is filled from a rate file written by an
//! external cron job and is only used to annotate journal records and
//! `CHECKAMOUNT` replies with a Euro value.

use std::path::Path;
use std::sync::RwLock;

use tracing::{error, info};

use crate::journal::Journal;

pub struct CurrencyInfo {
    pub name: &'static str,
    pub decdigits: u32,
    pub desc: &'static str,
}

/// The closed set of supported currencies.  EUR must stay the first entry;
/// its exchange rate is fixed at 1.0.
pub const CURRENCIES: [CurrencyInfo; 4] = [
    CurrencyInfo { name: "EUR", decdigits: 2, desc: "Euro" },
    CurrencyInfo { name: "USD", decdigits: 2, desc: "US Dollar" },
    CurrencyInfo { name: "GBP", decdigits: 2, desc: "British Pound" },
    CurrencyInfo { name: "JPY", decdigits: 0, desc: "Yen" },
];

/// Number of digits after the decimal point for CODE, or None if the
/// currency is not supported.  Comparison is case-insensitive.
pub fn decimal_digits(code: &str) -> Option<u32> {
    CURRENCIES
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(code))
        .map(|c| c.decdigits)
}

/// Convert the amount in STRING to the smallest currency unit.  DECDIGITS
/// gives the number of allowed post decimal positions.  Returns 0 on any
/// error (empty input, malformed number, too many fractional digits,
/// overflow); 0 is never a payable amount.
pub fn convert_amount(string: &str, decdigits: u32) -> u32 {
    let s = string.strip_prefix('+').unwrap_or(string);
    let mut ndots = 0u32;
    let mut nfrac = 0u32;
    let mut value: u32 = 0;
    if s.is_empty() {
        return 0;
    }
    for c in s.chars() {
        if c == '.' {
            if decdigits == 0 {
                return 0;
            }
            ndots += 1;
            if ndots > 1 {
                return 0;
            }
        } else if !c.is_ascii_digit() {
            return 0;
        } else {
            if ndots > 0 {
                nfrac += 1;
                if nfrac > decdigits {
                    return 0;
                }
            }
            value = match value
                .checked_mul(10)
                .and_then(|v| v.checked_add(c as u32 - '0' as u32))
            {
                Some(v) => v,
                None => return 0,
            };
        }
    }
    while nfrac < decdigits {
        value = match value.checked_mul(10) {
            Some(v) => v,
            None => return 0,
        };
        nfrac += 1;
    }
    value
}

/// Format CENTS back into a decimal amount string with DECDIGITS
/// fractional digits.
pub fn reconvert_amount(cents: u32, decdigits: u32) -> String {
    if decdigits == 0 {
        cents.to_string()
    } else {
        let tens = 10u32.pow(decdigits);
        format!(
            "{}.{:0width$}",
            cents / tens,
            cents % tens,
            width = decdigits as usize
        )
    }
}

/// Euro exchange rates for the currency table, refreshed from the rate
/// file by housekeeping.  A rate of 0.0 means "not known yet".
pub struct Rates {
    table: RwLock<[f64; CURRENCIES.len()]>,
}

impl Default for Rates {
    fn default() -> Self {
        Self::new()
    }
}

impl Rates {
    pub fn new() -> Self {
        let mut table = [0.0; CURRENCIES.len()];
        table[0] = 1.0; // EUR
        Self { table: RwLock::new(table) }
    }

    /// Exchange rate of CODE to Euro, or None when unknown.
    pub fn get_rate(&self, code: &str) -> Option<f64> {
        let idx = CURRENCIES
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(code))?;
        let rate = self.table.read().expect("rates lock")[idx];
        (rate > 0.0).then_some(rate)
    }

    /// Rate by table index, for `GETINFO list-currencies`.
    pub fn rate_at(&self, idx: usize) -> f64 {
        self.table.read().expect("rates lock")[idx]
    }

    /// Read the exchange-rate file and update the table.  Lines have the
    /// form `NAME=RATE`; empty lines and `#` comments are ignored.  Every
    /// change is recorded in the journal.
    pub fn reload(&self, path: &Path, journal: &Journal) {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) => {
                error!("error opening '{}': {}", path.display(), err);
                return;
            }
        };

        for (lnr, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, rate)) = line.split_once('=') else {
                error!(
                    "error parsing '{}', line {}: missing '='",
                    path.display(),
                    lnr + 1
                );
                continue;
            };
            let name = name.trim();
            // Skip the first entry: the EUR rate is fixed.
            let Some(idx) = CURRENCIES
                .iter()
                .skip(1)
                .position(|c| c.name.eq_ignore_ascii_case(name))
                .map(|i| i + 1)
            else {
                continue;
            };
            let rate = match rate.trim().parse::<f64>() {
                Ok(r) if r > 0.0 && r <= 10000.0 => r,
                _ => {
                    error!(
                        "error parsing '{}', line {}: invalid exchange rate",
                        path.display(),
                        lnr + 1
                    );
                    continue;
                }
            };

            let mut table = self.table.write().expect("rates lock");
            if table[idx] != rate {
                if table[idx] == 0.0 {
                    info!("setting exchange rate for {} to {:.4}", name, rate);
                } else {
                    info!(
                        "changing exchange rate for {} from {:.4} to {:.4}",
                        name, table[idx], rate
                    );
                }
                table[idx] = rate;
                drop(table);
                journal.store_exchange_rate_record(CURRENCIES[idx].name, rate);
            }
        }
    }
}

/// Convert (AMOUNT, CURRENCY) to a Euro amount string with two decimals.
/// Returns None when no exchange rate is known or AMOUNT does not parse.
pub fn convert_currency(rates: &Rates, currency: &str, amount: &str) -> Option<String> {
    let mut value = amount.trim().parse::<f64>().ok()?;
    let rate = rates.get_rate(currency)?;
    if rate != 1.0 {
        value /= rate;
        value += 0.005; // Nudge so that formatting rounds.
    }
    Some(format!("{value:.2}"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn convert_amount_vectors() {
        // (decdigits, input, expected)
        let tv: &[(u32, &str, u32)] = &[
            (0, "", 0),
            (0, " ", 0),
            (0, "-1", 0),
            (2, "1.23", 123),
            (2, "+1.23", 123),
            (2, "-1.23", 0),
            (2, "1.2", 120),
            (2, "1.", 100),
            (2, "1", 100),
            (2, "20", 2000),
            (2, "20.01", 2001),
            (2, "23.5", 2350),
            (2, "23+", 0),
            (2, "451..00", 0),
            (2, "45.1.00", 0),
            (2, "1.234", 0),
            (0, "1.0", 0),
            (3, "1.234", 1234),
            (2, "5000000000", 0), // overflow
        ];
        for &(digits, input, expected) in tv {
            assert_eq!(convert_amount(input, digits), expected, "input {input:?}");
        }
    }

    #[test]
    fn reconvert_formats() {
        assert_eq!(reconvert_amount(1042, 2), "10.42");
        assert_eq!(reconvert_amount(2000, 2), "20.00");
        assert_eq!(reconvert_amount(7, 2), "0.07");
        assert_eq!(reconvert_amount(500, 0), "500");
        assert_eq!(reconvert_amount(1, 3), "0.001");
    }

    #[test]
    fn currency_table_lookup() {
        assert_eq!(decimal_digits("EUR"), Some(2));
        assert_eq!(decimal_digits("eur"), Some(2));
        assert_eq!(decimal_digits("JPY"), Some(0));
        assert_eq!(decimal_digits("XXX"), None);
    }

    #[test]
    fn euro_conversion() {
        let rates = Rates::new();
        // EUR is always 1.0 and is not nudged.
        assert_eq!(
            convert_currency(&rates, "EUR", "10.42").as_deref(),
            Some("10.42")
        );
        // No USD rate known yet.
        assert_eq!(convert_currency(&rates, "USD", "10.00"), None);
        rates.table.write().unwrap()[1] = 2.0;
        assert_eq!(
            convert_currency(&rates, "USD", "9.99").as_deref(),
            Some("5.00") // 4.995 plus the rounding nudge
        );
    }

    proptest! {
        // P1: reconvert/convert round-trips over the full u32-safe range.
        #[test]
        fn prop_amount_round_trip(n in 0u32..=1_000_000_000, d in 0u32..=3) {
            let s = reconvert_amount(n, d);
            prop_assert_eq!(convert_amount(&s, d), n);
        }
    }
}
