//! The SEPA preorder database.
//!
//! A single table keyed by a minted reference code.  The code is printed
//! to users as `RRRRR-NN`; the five letter part is the primary key, the
//! two digit suffix groups references for reconciliation.  Rows are never
//! deleted: a reference stays valid for recurring transfers, `paid` and
//! `npaid` track the payments actually seen.

use std::path::Path;

use rand::Rng;

use crate::currency::Rates;
use crate::db::{datetime_now, Db, StoreError};
use crate::journal::{Journal, Service};
use crate::keyvalue::Dict;

/// Letters and digits used for the reference; letters that OCR scanning
/// tends to misread are left out.  The first position is restricted to a
/// letter.
const REF_CODES: [u8; 28] = *b"ABCDEGHJKLNRSTWXYZ0123456789";
const REF_LETTERS: usize = 18;

/// Bound on re-mints after a primary key collision, about 0.1% of the
/// key space.
const MAX_INSERT_RETRIES: usize = 11_000;

pub struct PreorderDb {
    db: Db,
}

/// Mint a candidate `RRRRR-NN` reference.
fn make_sepa_ref() -> String {
    let mut rng = rand::thread_rng();
    let mut nonce = [0u8; 5];
    rng.fill(&mut nonce[..]);

    let mut out = String::with_capacity(8);
    out.push(REF_CODES[nonce[0] as usize % REF_LETTERS] as char);
    for &b in &nonce[1..5] {
        out.push(REF_CODES[b as usize % REF_CODES.len()] as char);
    }
    let n = u32::from_be_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]);
    out.push('-');
    out.push_str(&format!("{:02}", 10 + n % 90));
    out
}

/// Split `RRRRR-NN` into the five character key.  Errors on an oversized
/// input.
fn ref_key(sepa_ref: &str) -> Result<&str, StoreError> {
    if sepa_ref.is_empty() || sepa_ref.len() > 8 {
        return Err(StoreError::InvalidLength);
    }
    let key = sepa_ref.split('-').next().unwrap_or(sepa_ref);
    if key.len() != 5 {
        return Err(StoreError::InvalidLength);
    }
    Ok(key)
}

// --- impl PreorderDb --- //

impl PreorderDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Db::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Db::open_in_memory()?)
    }

    fn init(db: Db) -> Result<Self, StoreError> {
        db.lock().execute(
            "CREATE TABLE IF NOT EXISTS preorder (
               ref      TEXT NOT NULL PRIMARY KEY,
               refnn    INTEGER NOT NULL,
               created  TEXT NOT NULL,
               paid     TEXT,
               npaid    INTEGER NOT NULL,
               amount   TEXT NOT NULL,
               currency TEXT NOT NULL,
               desc     TEXT,
               email    TEXT,
               meta     TEXT
             )",
            [],
        )?;
        Ok(Self { db })
    }

    /// Create a new preorder row from DICT.  The minted reference is
    /// copied into DICT as `Sepa-Ref`; on a primary key collision a new
    /// reference is minted and the insert retried.
    pub fn store_record(&self, dict: &mut Dict) -> Result<(), StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO preorder VALUES (?1,?2,?3,NULL,0,?4,?5,?6,?7,?8)",
        )?;

        for _ in 0..MAX_INSERT_RETRIES {
            let sepa_ref = make_sepa_ref();
            dict.put("Sepa-Ref", &sepa_ref);
            let res = stmt.execute(rusqlite::params![
                &sepa_ref[..5],
                sepa_ref[6..].parse::<i64>().unwrap_or(0),
                datetime_now(),
                dict.get_str("Amount"),
                "EUR",
                dict.get("Desc"),
                dict.get("Email"),
                dict.meta_to_string(),
            ]);
            match res {
                Ok(_) => return Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::TooManyRetries)
    }

    /// Fetch the row referenced by DICT's `Sepa-Ref` and merge its columns
    /// into DICT.
    pub fn get_record(&self, dict: &mut Dict) -> Result<(), StoreError> {
        let key = ref_key(dict.get_str("Sepa-Ref"))?.to_string();
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM preorder WHERE ref=?1")?;
        let mut rows = stmt.query([&key])?;
        match rows.next()? {
            Some(row) => put_columns(row, None, dict),
            None => Err(StoreError::NotFound),
        }
    }

    /// Reconcile a received payment: set `paid`, increment `npaid` and
    /// write a charge record to the journal.  The journal sees the row's
    /// data with the *actual* amount from DICT; when that amount differs
    /// from the preordered one, an `Amount-Mismatch` warning carrying the
    /// stored amount is added to DICT.
    pub fn update_record(
        &self,
        dict: &mut Dict,
        journal: &Journal,
        rates: &Rates,
    ) -> Result<(), StoreError> {
        let key = ref_key(dict.get_str("Sepa-Ref"))?.to_string();

        let mut olddata = Dict::new();
        olddata.put("Sepa-Ref", dict.get_str("Sepa-Ref"));
        self.get_record(&mut olddata)?;

        let stored_amount = olddata.get_str("Amount").to_string();
        let paid_amount = dict.get_str("Amount").to_string();
        if stored_amount != paid_amount {
            dict.put("Amount-Mismatch", &stored_amount);
        }
        // The journal records what was actually paid.
        olddata.put("Amount", &paid_amount);

        {
            let conn = self.db.lock();
            let mut stmt = conn.prepare_cached(
                "UPDATE preorder SET paid = ?2, npaid = npaid + 1 WHERE ref=?1",
            )?;
            let changed = stmt.execute(rusqlite::params![key, datetime_now()])?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
        }

        journal.store_charge_record(&mut olddata, Service::Sepa, rates);
        if let Some(ts) = olddata.get("_timestamp") {
            dict.put("_timestamp", ts);
        }
        Ok(())
    }

    /// List rows as `D[n]` entries in DICT, newest first, optionally
    /// filtered by DICT's `Refnn`.  Returns the row count.
    pub fn list_records(&self, dict: &mut Dict) -> Result<usize, StoreError> {
        let refnn = match dict.get("Refnn") {
            Some(s) => {
                if s.len() != 2 {
                    return Err(StoreError::InvalidLength);
                }
                Some(s.parse::<i64>().map_err(|_| StoreError::InvalidLength)?)
            }
            None => None,
        };

        let conn = self.db.lock();
        let mut count = 0;
        let mut emit = |row: &rusqlite::Row<'_>| -> Result<(), StoreError> {
            let line = format_row(row)?;
            dict.put_idx("D", Some(count), &line);
            count += 1;
            Ok(())
        };
        match refnn {
            Some(nn) => {
                let mut stmt = conn
                    .prepare_cached("SELECT * FROM preorder WHERE refnn=?1 ORDER BY ref")?;
                let mut rows = stmt.query([nn])?;
                while let Some(row) = rows.next()? {
                    emit(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM preorder ORDER BY created DESC, refnn ASC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    emit(row)?;
                }
            }
        }
        Ok(count)
    }
}

fn column_text(row: &rusqlite::Row<'_>, icol: usize) -> Result<String, StoreError> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(icol)? {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    })
}

/// Merge all columns of a row into DICT, optionally index-tagged.
fn put_columns(
    row: &rusqlite::Row<'_>,
    idx: Option<usize>,
    dict: &mut Dict,
) -> Result<(), StoreError> {
    let refname: String = row.get(0)?;
    let refnn: i64 = row.get(1)?;
    if !(0..=99).contains(&refnn) {
        return Err(StoreError::InvalidLength);
    }
    dict.put_idx("Sepa-Ref", idx, &format!("{refname}-{refnn:02}"));
    dict.put_idx("Created", idx, &column_text(row, 2)?);
    dict.put_idx("Paid", idx, &column_text(row, 3)?);
    dict.put_idx("N-Paid", idx, &column_text(row, 4)?);
    dict.put_idx("Amount", idx, &column_text(row, 5)?);
    dict.put_idx("Currency", idx, &column_text(row, 6)?);
    dict.put_idx("Desc", idx, &column_text(row, 7)?);
    dict.put_idx("Email", idx, &column_text(row, 8)?);
    let meta = column_text(row, 9)?;
    if !meta.is_empty() {
        // Expand the serialized meta string into Meta[...] items.
        let _ = dict.put_meta(&meta);
    }
    Ok(())
}

/// Format one row as the pipe delimited `D[n]` line.  Pipes inside field
/// values are encoded as `=7C`.
fn format_row(row: &rusqlite::Row<'_>) -> Result<String, StoreError> {
    let refname: String = row.get(0)?;
    let refnn: i64 = row.get(1)?;
    let mut out = format!("|{refname}-{refnn:02}");
    for icol in 2..=9 {
        out.push('|');
        out.push_str(&column_text(row, icol)?.replace('|', "=7C"));
    }
    out.push('|');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn preorder_dict(amount: &str, desc: &str) -> Dict {
        let mut dict = Dict::new();
        dict.put("Amount", amount);
        dict.put("Currency", "EUR");
        dict.put("Desc", desc);
        dict
    }

    #[test]
    fn sepa_ref_shape() {
        for _ in 0..500 {
            let r = make_sepa_ref();
            assert_eq!(r.len(), 8);
            let (code, nn) = r.split_once('-').unwrap();
            assert!(code.bytes().all(|b| REF_CODES.contains(&b)));
            assert!(code.as_bytes()[0].is_ascii_uppercase());
            let nn: u32 = nn.parse().unwrap();
            assert!((10..=99).contains(&nn));
        }
    }

    // P6: inserted references are pairwise distinct and retrievable.
    #[test]
    fn insert_is_unique_and_retrievable() {
        let store = PreorderDb::open_in_memory().unwrap();
        let mut seen = HashSet::new();
        for i in 0..100 {
            let mut dict = preorder_dict("20.00", &format!("order {i}"));
            dict.put("Meta[Origin]", "test");
            store.store_record(&mut dict).unwrap();
            let sepa_ref = dict.get("Sepa-Ref").unwrap().to_string();
            assert!(seen.insert(sepa_ref.clone()), "duplicate ref {sepa_ref}");

            let mut fetched = Dict::new();
            fetched.put("Sepa-Ref", &sepa_ref);
            store.get_record(&mut fetched).unwrap();
            assert_eq!(fetched.get("Amount"), Some("20.00"));
            assert_eq!(fetched.get("Currency"), Some("EUR"));
            assert_eq!(fetched.get("N-Paid"), Some("0"));
            assert_eq!(fetched.get("Meta[Origin]"), Some("test"));
        }
    }

    #[test]
    fn get_unknown_ref_is_not_found() {
        let store = PreorderDb::open_in_memory().unwrap();
        let mut dict = Dict::new();
        dict.put("Sepa-Ref", "AAAAA-11");
        assert!(matches!(
            store.get_record(&mut dict),
            Err(StoreError::NotFound)
        ));
        dict.put("Sepa-Ref", "TOO-LONG-REF");
        assert!(matches!(
            store.get_record(&mut dict),
            Err(StoreError::InvalidLength)
        ));
    }

    #[test]
    fn commit_increments_npaid_and_flags_mismatch() {
        let store = PreorderDb::open_in_memory().unwrap();
        let journal = Journal::new(None);
        let rates = Rates::new();

        let mut dict = preorder_dict("20.00", "order");
        store.store_record(&mut dict).unwrap();
        let sepa_ref = dict.get("Sepa-Ref").unwrap().to_string();

        let mut commit = Dict::new();
        commit.put("Sepa-Ref", &sepa_ref);
        commit.put("Amount", "20.00");
        store.update_record(&mut commit, &journal, &rates).unwrap();
        assert_eq!(commit.get("Amount-Mismatch"), None);

        // A differing amount still reconciles but is flagged.
        let mut commit = Dict::new();
        commit.put("Sepa-Ref", &sepa_ref);
        commit.put("Amount", "25.00");
        store.update_record(&mut commit, &journal, &rates).unwrap();
        assert_eq!(commit.get("Amount-Mismatch"), Some("20.00"));

        let mut fetched = Dict::new();
        fetched.put("Sepa-Ref", &sepa_ref);
        store.get_record(&mut fetched).unwrap();
        assert_eq!(fetched.get("N-Paid"), Some("2"));
        assert_ne!(fetched.get("Paid"), Some(""));

        let mut commit = Dict::new();
        commit.put("Sepa-Ref", "ZZZZZ-99");
        commit.put("Amount", "1.00");
        assert!(matches!(
            store.update_record(&mut commit, &journal, &rates),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn list_formats_rows() {
        let store = PreorderDb::open_in_memory().unwrap();
        let mut a = preorder_dict("1.00", "first|with pipe");
        store.store_record(&mut a).unwrap();
        let mut b = preorder_dict("2.00", "second");
        store.store_record(&mut b).unwrap();

        let mut dict = Dict::new();
        let count = store.list_records(&mut dict).unwrap();
        assert_eq!(count, 2);
        let d0 = dict.get("D[0]").unwrap();
        let d1 = dict.get("D[1]").unwrap();
        assert!(d0.starts_with('|') && d0.ends_with('|'));
        // 11 pipes delimit the ref plus nine data columns.
        assert_eq!(d0.matches('|').count(), 11);
        assert!(d0.contains("=7C") || d1.contains("=7C"));

        // Filtering by a bad Refnn length is rejected.
        let mut dict = Dict::new();
        dict.put("Refnn", "123");
        assert!(matches!(
            store.list_records(&mut dict),
            Err(StoreError::InvalidLength)
        ));

        // Filter by the suffix of the first record.
        let nn = a.get("Sepa-Ref").unwrap()[6..].to_string();
        let mut dict = Dict::new();
        dict.put("Refnn", &nn);
        let count = store.list_records(&mut dict).unwrap();
        assert!(count >= 1);
        assert!(dict.get("D[0]").is_some());
    }
}
