//! The subscription account database.
//!
//! An account row ties our own account id to the gateway's customer or
//! payer reference.  The gateway reference is stored encrypted to the
//! database key and the backoffice key; the daemon itself never needs to
//! read it back.

use std::path::Path;
use std::sync::Arc;

use rand::Rng;

use crate::db::{datetime_now, Db, StoreError};
use crate::encrypt::{Audience, Encrypt};
use crate::keyvalue::Dict;

/// Alphabet for the 14 random characters after the 'A' prefix.  31
/// letters and digits give roughly 2^69 distinct ids.
const ID_CODES: [u8; 31] = *b"0123456789abcdefghkmnpqrstuwxyz";

pub struct AccountDb {
    db: Db,
    encryptor: Arc<dyn Encrypt>,
}

/// Mint a candidate account id: 'A' followed by 14 alphabet characters.
fn make_account_id() -> String {
    let mut rng = rand::thread_rng();
    let mut nonce = [0u8; 14];
    rng.fill(&mut nonce[..]);

    let mut out = String::with_capacity(15);
    out.push('A');
    for b in nonce {
        out.push(ID_CODES[b as usize % ID_CODES.len()] as char);
    }
    out
}

// --- impl AccountDb --- //

impl AccountDb {
    pub fn open(path: &Path, encryptor: Arc<dyn Encrypt>) -> Result<Self, StoreError> {
        Self::init(Db::open(path)?, encryptor)
    }

    pub fn open_in_memory(encryptor: Arc<dyn Encrypt>) -> Result<Self, StoreError> {
        Self::init(Db::open_in_memory()?, encryptor)
    }

    fn init(db: Db, encryptor: Arc<dyn Encrypt>) -> Result<Self, StoreError> {
        db.lock().execute(
            "CREATE TABLE IF NOT EXISTS account (
               account_id   TEXT NOT NULL PRIMARY KEY,
               created      TEXT NOT NULL,
               updated      TEXT NOT NULL,
               email        TEXT,
               verified     INTEGER NOT NULL,
               customer_ref TEXT,
               meta         TEXT
             )",
            [],
        )?;
        Ok(Self { db, encryptor })
    }

    /// Insert a fresh, empty account row and return its id.
    pub fn new_record(&self) -> Result<String, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO account (account_id, created, updated, verified)
             VALUES (?1, ?2, ?2, 0)",
        )?;
        loop {
            let account_id = make_account_id();
            match stmt.execute(rusqlite::params![account_id, datetime_now()]) {
                Ok(_) => return Ok(account_id),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Update the row named by DICT's `account-id`: the gateway customer
    /// reference (`_stripe_cus` or `_paypal_payer_id`) is stored encrypted
    /// to the database and backoffice keys; `Email` is stored as given.
    pub fn update_record(&self, dict: &Dict) -> Result<(), StoreError> {
        let account_id = dict.get_str("account-id");
        if account_id.is_empty() {
            return Err(StoreError::NotFound);
        }
        let customer_ref = match dict.get("_stripe_cus").or_else(|| dict.get("_paypal_payer_id")) {
            Some(s) if !s.is_empty() => s,
            _ => return Err(StoreError::NotFound),
        };

        let encrypted = self
            .encryptor
            .encrypt_to_keys(customer_ref, Audience::BOTH)
            .map_err(|err| StoreError::Encrypt(format!("{err:#}")))?;

        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "UPDATE account SET updated = ?2, customer_ref = ?3, email = ?4
             WHERE account_id = ?1",
        )?;
        let changed = stmt.execute(rusqlite::params![
            account_id,
            datetime_now(),
            encrypted,
            dict.get("Email"),
        ])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::encrypt::PlainEncryptor;

    use super::*;

    fn test_db() -> AccountDb {
        AccountDb::open_in_memory(Arc::new(PlainEncryptor)).unwrap()
    }

    #[test]
    fn account_id_shape() {
        for _ in 0..200 {
            let id = make_account_id();
            assert_eq!(id.len(), 15);
            assert!(id.starts_with('A'));
            assert!(id.bytes().skip(1).all(|b| ID_CODES.contains(&b)));
        }
    }

    #[test]
    fn new_and_update() {
        let db = test_db();
        let account_id = db.new_record().unwrap();

        let mut dict = Dict::new();
        dict.put("account-id", &account_id);
        dict.put("_stripe_cus", "cus_123");
        dict.put("Email", "donor@example.org");
        db.update_record(&dict).unwrap();

        // The payer-id variant works the same way.
        let mut dict = Dict::new();
        dict.put("account-id", &account_id);
        dict.put("_paypal_payer_id", "PAYER42");
        db.update_record(&dict).unwrap();
    }

    #[test]
    fn update_requires_row_and_reference() {
        let db = test_db();
        let mut dict = Dict::new();
        dict.put("account-id", "Aunknownunknown");
        dict.put("_stripe_cus", "cus_123");
        assert!(matches!(db.update_record(&dict), Err(StoreError::NotFound)));

        let account_id = db.new_record().unwrap();
        let mut dict = Dict::new();
        dict.put("account-id", &account_id);
        assert!(matches!(db.update_record(&dict), Err(StoreError::NotFound)));
    }
}
