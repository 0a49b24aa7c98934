//! Client for the stripe.com REST API.
//!
//! Stripe takes form encoded requests authenticated with the secret key
//! as HTTP basic user.  Successful and client-error responses (2xx/4xx)
//! carry JSON bodies; error objects are mapped into `failure` /
//! `failure-mesg` reply items so the frontend can show something useful.

use anyhow::{anyhow, bail, Context};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::account::AccountDb;
use crate::keyvalue::Dict;

const STRIPE_HOST: &str = "https://api.stripe.com";

type Form = Vec<(&'static str, String)>;

pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    debug: bool,
}

// --- impl StripeClient --- //

impl StripeClient {
    pub fn new(secret_key: String, debug: bool) -> Self {
        Self::with_base_url(STRIPE_HOST.to_string(), secret_key, debug)
    }

    /// Like [`new`](Self::new) with an explicit API host, used by the
    /// tests to talk to a local mock.
    pub fn with_base_url(base_url: String, secret_key: String, debug: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            secret_key,
            debug,
        }
    }

    /// Perform one call.  METHOD is the path below `/v1/` and ITEM an
    /// optional trailing id.  With FORM given the request is a POST,
    /// otherwise a GET.  2xx and 4xx bodies are parsed as JSON (empty
    /// body becomes null); other statuses are hard errors.
    async fn call(
        &self,
        method: &str,
        item: Option<&str>,
        form: Option<&Form>,
    ) -> anyhow::Result<(u16, Value)> {
        let mut url = format!("{}/v1/{}", self.base_url, method);
        if let Some(item) = item {
            url.push('/');
            url.push_str(item);
        }

        if self.debug {
            debug!("stripe-req: {} {}", if form.is_some() { "POST" } else { "GET" }, url);
        }

        let request = match form {
            Some(form) => self.http.post(&url).form(form),
            None => self.http.get(&url),
        };
        let response = request
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .with_context(|| format!("error accessing '{url}'"))?;

        let status = response.status().as_u16();
        if !matches!(status / 100, 2 | 4) {
            bail!("stripe: unexpected status {status} for '{url}'");
        }
        let body = response.text().await?;
        let json: Value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).context("stripe: malformed JSON response")?
        };
        if self.debug {
            debug!("stripe-rsp: {status} {json}");
        }
        Ok((status, json))
    }

    /// The gateway part of CARDTOKEN: mint a one-time token from the raw
    /// card data and strip that data from the dictionary.
    pub async fn create_card_token(&self, dict: &mut Dict) -> anyhow::Result<()> {
        let mut query: Form = Vec::new();

        let number = dict.get_str("Number");
        if number.is_empty() {
            bail!("missing card number");
        }
        query.push(("card[number]", number.to_string()));

        let year = dict.get_int("Exp-Year");
        if !(2014..=2199).contains(&year) {
            bail!("expiration year out of range");
        }
        query.push(("card[exp_year]", year.to_string()));

        let month = dict.get_int("Exp-Month");
        if !(1..=12).contains(&month) {
            bail!("invalid expiration month");
        }
        query.push(("card[exp_month]", month.to_string()));

        let cvc = dict.get_int("Cvc");
        if !(100..=9999).contains(&cvc) {
            bail!("invalid CVC");
        }
        query.push(("card[cvc]", cvc.to_string()));

        if let Some(name) = dict.get("Name").filter(|s| !s.is_empty()) {
            query.push(("card[name]", name.to_string()));
        }

        // The raw card data must not survive in the dictionary.
        dict.remove("Number");
        dict.remove("Exp-Year");
        dict.remove("Exp-Month");
        dict.remove("Cvc");

        let (status, json) = self.call("tokens", None, Some(&query)).await?;
        if status != 200 {
            extract_error_from_json(dict, &json);
            bail!("create_card_token: status={status}");
        }

        let id = require_str(&json, "id")?;
        let live = require_bool(&json, "livemode")?;
        let last4 = json
            .pointer("/card/last4")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("bad or missing 'card/last4'"))?;

        dict.put("Live", if live { "t" } else { "f" });
        dict.put("Last4", last4);
        dict.put("Token", id);
        Ok(())
    }

    /// The gateway part of a one-shot CHARGECARD.
    pub async fn charge_card(&self, dict: &mut Dict) -> anyhow::Result<()> {
        let mut query: Form = Vec::new();

        let currency = dict.get_str("Currency");
        if currency.is_empty() {
            bail!("missing currency");
        }
        query.push(("currency", currency.to_string()));

        // _amount is the amount in the smallest unit of the currency.
        let amount = dict.get_str("_amount");
        if amount.is_empty() {
            bail!("missing _amount");
        }
        query.push(("amount", amount.to_string()));

        let token = dict.get_str("Card-Token");
        if token.is_empty() {
            bail!("missing Card-Token");
        }
        query.push(("card", token.to_string()));
        // The token is one-time use; forget it right away.
        dict.remove("Card-Token");

        if let Some(desc) = dict.get("Desc").filter(|s| !s.is_empty()) {
            query.push(("description", desc.to_string()));
        }
        if let Some(stmt) = dict.get("Stmt-Desc").filter(|s| !s.is_empty()) {
            query.push(("statement_description", stmt.to_string()));
        }

        let (status, json) = self.call("charges", None, Some(&query)).await?;
        if status != 200 {
            extract_error_from_json(dict, &json);
            bail!("charge_card: status={status}");
        }

        dict.put("Charge-Id", require_str(&json, "id")?);
        match json.get("balance_transaction").and_then(Value::as_str) {
            Some(txid) => dict.put("balance-transaction", txid),
            None => dict.remove("balance-transaction"),
        }
        let live = require_bool(&json, "livemode")?;
        dict.put("Live", if live { "t" } else { "f" });
        dict.put("Currency", require_str(&json, "currency")?);
        let amount = json
            .get("amount")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("bad or missing 'amount'"))?;
        dict.put("_amount", &amount.to_string());
        match json.pointer("/card/last4").and_then(Value::as_str) {
            Some(last4) => dict.put("Last4", last4),
            None => dict.remove("Last4"),
        }
        Ok(())
    }

    /// Retrieve or create the plan matching `_amount`, `Currency` and
    /// `Recur`.  Plans are addressed by a deterministic id, so a plain
    /// GET decides between reuse and creation.  On success `_plan-id` is
    /// set in DICT.
    pub async fn find_create_plan(&self, dict: &mut Dict) -> anyhow::Result<()> {
        let currency = dict.get_str("Currency").to_ascii_lowercase();
        if currency.is_empty() {
            bail!("missing currency");
        }
        let recur = dict.get_int("Recur");
        if !matches!(recur, 1 | 4 | 12) {
            bail!("bad Recur value");
        }
        let amount = dict.get_str("_amount").to_string();
        if amount.is_empty() {
            bail!("missing _amount");
        }

        let plan_id = format!("gnupg-{recur}-{amount}-{currency}");

        let (status, json) = self.call("plans", Some(&plan_id), None).await?;
        if status == 200 {
            // The plan already exists.
            dict.put("_plan-id", require_str(&json, "id")?);
            return Ok(());
        }
        if status != 404 {
            extract_error_from_json(dict, &json);
            bail!("retrieve_plan: status={status}");
        }

        // Not found; create it.
        let stmt_desc = dict.get_str("Stmt-Desc");
        if stmt_desc.is_empty() {
            bail!("missing Stmt-Desc");
        }
        let name = format!(
            "{}{}",
            match recur {
                1 => "Yearly ",
                4 => "Quarterly ",
                _ => "Monthly ",
            },
            stmt_desc
        );
        let descriptor: String = name.chars().take(22).collect();
        let (interval, interval_count) = match recur {
            12 => ("month", "1"),
            4 => ("month", "3"),
            _ => ("year", "1"),
        };

        let request: Form = vec![
            ("id", plan_id.clone()),
            ("currency", currency),
            ("amount", amount),
            ("interval", interval.to_string()),
            ("interval_count", interval_count.to_string()),
            ("name", name),
            ("statement_descriptor", descriptor),
        ];
        let (status, json) = self.call("plans", None, Some(&request)).await?;
        if status != 200 {
            extract_error_from_json(dict, &json);
            bail!("create_plan: status={status}");
        }
        dict.put("_plan-id", require_str(&json, "id")?);
        Ok(())
    }

    /// Create a customer and subscribe it to the plan from
    /// [`find_create_plan`](Self::find_create_plan).  A fresh account row
    /// records the mapping from our account id to the Stripe customer.
    pub async fn create_subscription(
        &self,
        accounts: &AccountDb,
        dict: &mut Dict,
    ) -> anyhow::Result<()> {
        let plan_id = dict.get_str("_plan-id").to_string();
        if plan_id.is_empty() {
            bail!("missing '_plan-id'");
        }
        let token = dict.get_str("Card-Token").to_string();
        if token.is_empty() {
            bail!("missing 'Card-Token'");
        }
        let email = dict.get_str("Email").to_string();
        if email.is_empty() {
            bail!("missing 'Email'");
        }

        // Create a new empty account for the customer.  The id also goes
        // into Stripe's metadata so the records can be correlated.
        let account_id = accounts.new_record()?;
        let request: Form = vec![
            ("email", email.clone()),
            ("metadata[account_id]", account_id.clone()),
        ];
        let (status, json) = self.call("customers", None, Some(&request)).await?;
        if status != 200 {
            extract_error_from_json(dict, &json);
            bail!("create_customer: status={status}");
        }
        let customer_id = require_str(&json, "id")?.to_string();

        let request: Form = vec![
            ("customer", customer_id.clone()),
            ("source", token),
            ("plan", plan_id),
        ];
        // The token is one-time use; forget it right away.
        dict.remove("Card-Token");

        let (status, json) = self.call("subscriptions", None, Some(&request)).await?;
        if status != 200 {
            extract_error_from_json(dict, &json);
            bail!("create_subscription: status={status}");
        }
        let live = require_bool(&json, "livemode")?;
        dict.put("Live", if live { "t" } else { "f" });
        dict.put("account-id", &account_id);

        let mut accountdict = Dict::new();
        accountdict.put("account-id", &account_id);
        accountdict.put("_stripe_cus", &customer_id);
        if let Some(email) = dict.get("Email") {
            accountdict.put("Email", email);
        }
        accounts.update_record(&accountdict)?;
        Ok(())
    }
}

fn require_str<'a>(json: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    json.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("bad or missing '{key}'"))
}

fn require_bool(json: &Value, key: &str) -> anyhow::Result<bool> {
    json.get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| anyhow!("bad or missing '{key}'"))
}

/// Map a Stripe error object into the `failure` / `failure-mesg` reply
/// items.
fn extract_error_from_json(dict: &mut Dict, json: &Value) {
    let Some(error) = json.get("error").filter(|e| e.is_object()) else {
        warn!("stripe: no proper error object returned");
        return;
    };
    let Some(kind) = error.get("type").and_then(Value::as_str) else {
        warn!("stripe: error object has no 'type'");
        return;
    };
    let mesg = error.get("message").and_then(Value::as_str).unwrap_or("");
    let code = error.get("code").and_then(Value::as_str).unwrap_or("");

    info!("stripe: error: type='{kind}' code='{code}' mesg='{mesg:.100}'");

    match kind {
        "invalid_request_error" => dict.put("failure", "invalid request to stripe"),
        "api_error" => dict.put("failure", "bad request to stripe"),
        "card_error" => {
            dict.put("failure", if code.is_empty() { "card error" } else { code });
            if !mesg.is_empty() {
                dict.put("failure-mesg", mesg);
            }
        }
        other => {
            warn!("stripe: unknown type '{other}' in error object");
            dict.put("failure", "unknown error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> StripeClient {
        StripeClient::with_base_url(server.url(), "sk_test_123".to_string(), false)
    }

    #[tokio::test]
    async fn card_token_happy_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/tokens")
            .with_status(200)
            .with_body(
                r#"{"id":"tok_1","livemode":false,"card":{"last4":"4242"}}"#,
            )
            .create_async()
            .await;

        let mut dict = Dict::new();
        dict.put("Number", "4242424242424242");
        dict.put("Exp-Year", "2030");
        dict.put("Exp-Month", "12");
        dict.put("Cvc", "123");

        client_for(&server).create_card_token(&mut dict).await.unwrap();
        mock.assert_async().await;

        assert_eq!(dict.get("Token"), Some("tok_1"));
        assert_eq!(dict.get("Last4"), Some("4242"));
        assert_eq!(dict.get("Live"), Some("f"));
        // Raw card data is gone.
        assert_eq!(dict.get("Number"), None);
        assert_eq!(dict.get("Cvc"), None);
    }

    #[tokio::test]
    async fn card_error_maps_failure_fields() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/charges")
            .with_status(402)
            .with_body(
                r#"{"error":{"type":"card_error","code":"card_declined","message":"Your card was declined."}}"#,
            )
            .create_async()
            .await;

        let mut dict = Dict::new();
        dict.put("Currency", "EUR");
        dict.put("_amount", "1042");
        dict.put("Card-Token", "tok_1");

        let err = client_for(&server).charge_card(&mut dict).await.unwrap_err();
        assert!(err.to_string().contains("402"));
        assert_eq!(dict.get("failure"), Some("card_declined"));
        assert_eq!(dict.get("failure-mesg"), Some("Your card was declined."));
    }

    #[tokio::test]
    async fn plan_is_created_when_missing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/plans/gnupg-12-500-eur")
            .with_status(404)
            .with_body(r#"{"error":{"type":"invalid_request_error","message":"No such plan"}}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/v1/plans")
            .with_status(200)
            .with_body(r#"{"id":"gnupg-12-500-eur"}"#)
            .create_async()
            .await;

        let mut dict = Dict::new();
        dict.put("Currency", "EUR");
        dict.put("Recur", "12");
        dict.put("_amount", "500");
        dict.put("Stmt-Desc", "GnuPG donation");

        client_for(&server).find_create_plan(&mut dict).await.unwrap();
        create.assert_async().await;
        assert_eq!(dict.get("_plan-id"), Some("gnupg-12-500-eur"));
    }

    #[tokio::test]
    async fn existing_plan_is_reused() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/plans/gnupg-1-10000-usd")
            .with_status(200)
            .with_body(r#"{"id":"gnupg-1-10000-usd"}"#)
            .create_async()
            .await;

        let mut dict = Dict::new();
        dict.put("Currency", "USD");
        dict.put("Recur", "1");
        dict.put("_amount", "10000");

        client_for(&server).find_create_plan(&mut dict).await.unwrap();
        assert_eq!(dict.get("_plan-id"), Some("gnupg-1-10000-usd"));
    }
}
