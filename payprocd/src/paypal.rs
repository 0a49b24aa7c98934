//! Client for the PayPal REST API and the checkout orchestration.
//!
//! PayPal wants JSON requests under a bearer token from an OAuth2
//! `client_credentials` grant.  The token is cached; a 401 seen anywhere
//! invalidates the cache.  Checkout is a two step dance: `prepare` parks
//! the collected state in an aliased session and sends the user off to
//! PayPal's approval URL, `execute` is called when they come back, with
//! the alias as the one-shot handle to the parked state.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Context};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::account::AccountDb;
use crate::keyvalue::Dict;
use crate::session::{unix_now, SessionStore};

const PAYPAL_LIVE_HOST: &str = "https://api.paypal.com";
const PAYPAL_TEST_HOST: &str = "https://api.sandbox.paypal.com";
const WEBSCR_LIVE: &str = "https://www.paypal.com/cgi-bin/webscr";
const WEBSCR_SANDBOX: &str = "https://www.sandbox.paypal.com/cgi-bin/webscr";

/// Maximum page size allowed by the billing-plans list call.
const PLAN_PAGE_SIZE: usize = 20;

type Form = Vec<(&'static str, String)>;

struct TokenCache {
    access_token: Option<String>,
    expires_on: i64,
}

/// Body of a successful OAuth2 `client_credentials` response.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
    expires_in: i64,
}

pub struct PaypalClient {
    http: reqwest::Client,
    base_url: String,
    webscr_url: String,
    webscr_sandbox_url: String,
    client_id: String,
    client_secret: String,
    livemode: bool,
    debug: bool,
    token: tokio::sync::Mutex<TokenCache>,
    /// Set on any 401; makes the next token request bypass the cache.
    unauthorized_seen: AtomicBool,
}

enum Body<'a> {
    None,
    Form(&'a Form),
    Json(&'a Value),
}

/// If METHOD is a complete URL with our own prefix, skip over it.  This
/// lets HATEOAS URLs from earlier responses be passed as methods while
/// still making sure we only ever talk to the expected host.
fn trim_own_prefix<'a>(urlprefix: &str, method: &'a str, has_item: bool) -> &'a str {
    if !has_item && method.starts_with(urlprefix) {
        &method[urlprefix.len()..]
    } else {
        method
    }
}

// --- impl PaypalClient --- //

impl PaypalClient {
    /// SECRET_KEY is the `client_id:secret` pair from the configuration.
    pub fn new(secret_key: &str, livemode: bool, debug: bool) -> Self {
        let base_url = if livemode { PAYPAL_LIVE_HOST } else { PAYPAL_TEST_HOST };
        Self::with_urls(
            base_url.to_string(),
            WEBSCR_LIVE.to_string(),
            WEBSCR_SANDBOX.to_string(),
            secret_key,
            livemode,
            debug,
        )
    }

    /// Constructor with explicit endpoints, used by tests.
    pub fn with_urls(
        base_url: String,
        webscr_url: String,
        webscr_sandbox_url: String,
        secret_key: &str,
        livemode: bool,
        debug: bool,
    ) -> Self {
        let (client_id, client_secret) = match secret_key.split_once(':') {
            Some((id, secret)) => (id.to_string(), secret.to_string()),
            None => (secret_key.to_string(), String::new()),
        };
        Self {
            http: reqwest::Client::new(),
            base_url,
            webscr_url,
            webscr_sandbox_url,
            client_id,
            client_secret,
            livemode,
            debug,
            token: tokio::sync::Mutex::new(TokenCache {
                access_token: None,
                expires_on: 0,
            }),
            unauthorized_seen: AtomicBool::new(false),
        }
    }

    pub fn livemode(&self) -> bool {
        self.livemode
    }

    /// Perform one call.  METHOD is the path below `/v1/` or a complete
    /// HATEOAS URL with our own prefix; ITEM an optional trailing id.
    /// 2xx, 4xx and 5xx bodies are parsed as JSON (empty becomes null).
    async fn call(
        &self,
        method: Method,
        bearer: Option<&str>,
        path: &str,
        item: Option<&str>,
        body: Body<'_>,
    ) -> anyhow::Result<(u16, Value)> {
        let urlprefix = format!("{}/v1/", self.base_url);
        let path = trim_own_prefix(&urlprefix, path, item.is_some());
        let mut url = format!("{urlprefix}{path}");
        if let Some(item) = item {
            url.push('/');
            url.push_str(item);
        }

        if self.debug {
            debug!("paypal-req: {method} {url}");
        }

        let mut request = self
            .http
            .request(method, &url)
            .header("Accept", "application/json");
        request = match bearer {
            Some(token) => request.bearer_auth(token),
            None => request.basic_auth(&self.client_id, Some(&self.client_secret)),
        };
        request = match body {
            Body::None => request,
            Body::Form(form) => request.form(form),
            Body::Json(value) => request.json(value),
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("error accessing '{url}'"))?;
        let status = response.status().as_u16();
        if status == 401 {
            self.unauthorized_seen.store(true, Ordering::Relaxed);
        }

        if !matches!(status / 100, 2 | 4 | 5) {
            bail!("paypal: unexpected status {status} for '{url}'");
        }
        let body = response.text().await?;
        let json: Value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).context("paypal: malformed JSON response")?
        };
        if self.debug {
            debug!("paypal-rsp: {status} {json}");
        }
        Ok((status, json))
    }

    /// Return a cached OAuth2 access token, fetching a fresh one when the
    /// cache is cold, too close to expiry, or poisoned by a 401.
    pub async fn get_access_token(&self) -> anyhow::Result<String> {
        let mut cache = self.token.lock().await;

        let mut retries = 10;
        loop {
            let now = unix_now();
            match &cache.access_token {
                None => info!("paypal: cached access token: not yet cached"),
                Some(_) if self.unauthorized_seen.load(Ordering::Relaxed) => {
                    info!("paypal: cached access token: 401 recently seen")
                }
                Some(token) if now + 30 < cache.expires_on => {
                    return Ok(token.clone());
                }
                Some(_) => info!("paypal: cached access token: expire time too close"),
            }
            self.unauthorized_seen.store(false, Ordering::Relaxed);

            if retries == 0 {
                bail!("error getting access token: too many retries");
            }
            retries -= 1;

            let request_time = unix_now();
            let form: Form = vec![("grant_type", "client_credentials".to_string())];
            let (status, json) = self
                .call(Method::POST, None, "oauth2/token", None, Body::Form(&form))
                .await?;
            if status != 200 {
                bail!("error getting access token: status={status}");
            }

            let token: TokenResponse = serde_json::from_value(json)
                .context("error getting access token: malformed response")?;
            if !token.token_type.eq_ignore_ascii_case("bearer") {
                bail!("error getting access token: bad 'token_type'");
            }
            if token.access_token.is_empty() {
                bail!("error getting access token: bad 'access_token'");
            }
            // Require at least a minute of usable lifetime.
            if token.expires_in < 60 {
                bail!("error getting access token: bad 'expires_in'");
            }

            // Leave some leeway before the reported expiry.
            let mut expires_on = request_time + token.expires_in;
            if token.expires_in > 1800 {
                expires_on -= 900;
            } else if token.expires_in > 600 {
                expires_on -= 300;
            }
            cache.access_token = Some(token.access_token);
            cache.expires_on = expires_on;
        }
    }

    /// Find the id of an ACTIVE billing plan by NAME.  Ok(None) when no
    /// plan matches.  On several matches the one with the largest
    /// `update_time` wins; ties go to the shorter, then lexicographically
    /// smaller id.
    async fn find_plan(&self, name: &str, access_token: &str) -> anyhow::Result<Option<String>> {
        let mut best: Option<(String, String)> = None; // (update_time, id)
        let mut page = 0;
        loop {
            let path = format!(
                "payments/billing-plans?status=ACTIVE&page_size={PLAN_PAGE_SIZE}&page={page}"
            );
            let (status, json) = self
                .call(Method::GET, Some(access_token), &path, None, Body::None)
                .await?;
            if status == 204 {
                break; // No more plans.
            }
            if status != 200 {
                extract_error_from_json(None, &json);
                bail!("find_plan: status={status}");
            }

            let plans = json
                .get("plans")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("find_plan: unexpected object returned"))?;
            for item in plans {
                let Some(id) = item.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let my_name = item.get("name").and_then(Value::as_str).unwrap_or("[?]");
                let upd = item.get("update_time").and_then(Value::as_str).unwrap_or("");
                if my_name != name {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_upd, best_id)) => {
                        // ISO-8601 sorts lexicographically.
                        upd > best_upd.as_str()
                            || (upd == best_upd
                                && (id.len(), id) < (best_id.len(), best_id.as_str()))
                    }
                };
                if better {
                    best = Some((upd.to_string(), id.to_string()));
                }
            }
            if plans.len() < PLAN_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(best.map(|(_, id)| id))
    }

    /// Retrieve or create the billing plan for `Amount`, `Currency` and
    /// `Recur`.  On success `_plan-name` and `_plan-id` are set in DICT.
    pub async fn find_create_plan(&self, dict: &mut Dict) -> anyhow::Result<()> {
        let currency = dict.get_str("Currency").to_string();
        if currency.is_empty() {
            bail!("missing currency");
        }
        let recur = dict.get_int("Recur");
        let recur_text = match recur {
            1 => "yearly",
            4 => "quarterly",
            12 => "monthly",
            _ => bail!("bad Recur value"),
        };
        let amount = dict.get_str("Amount").to_string();
        if amount.is_empty() {
            bail!("missing amount");
        }

        let plan_name =
            format!("gnupg-{recur}-{amount}-{currency}").to_ascii_lowercase();
        dict.put("_plan-name", &plan_name);

        let access_token = self.get_access_token().await?;

        if let Some(plan_id) = self.find_plan(&plan_name, &access_token).await? {
            info!("found plan '{plan_name}' with id '{plan_id}'");
            dict.put("_plan-id", &plan_id);
            return Ok(());
        }

        // No such plan - create a new one.  The merchant preference URLs
        // are not used but required by the API.
        let request = json!({
            "name": plan_name,
            "description": format!("{amount} {currency} {recur_text} for gnupg"),
            "type": "INFINITE",
            "payment_definitions": [{
                "name": format!("{recur_text} payment of {amount} {currency}"),
                "type": "REGULAR",
                "frequency": if recur == 1 { "YEAR" } else { "MONTH" },
                "frequency_interval": if recur == 4 { "3" } else { "1" },
                "cycles": "0",
                "amount": { "value": amount, "currency": currency }
            }],
            "merchant_preferences": {
                "auto_bill_amount": "NO",
                "initial_fail_amount_action": "CONTINUE",
                "max_fail_attempts": "0",
                "return_url": "https://www.paypal.com",
                "cancel_url": "http://www.paypal.com/cancel"
            }
        });
        let (status, json) = self
            .call(
                Method::POST,
                Some(&access_token),
                "payments/billing-plans",
                None,
                Body::Json(&request),
            )
            .await?;
        if status != 201 {
            extract_error_from_json(Some(dict), &json);
            bail!("create_plan: status={status}");
        }
        let plan_id = json
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("plan id missing in result"))?
            .to_string();
        info!("paypal: new plan '{plan_name}' with id '{plan_id}' created");

        // Move the plan from CREATED to ACTIVE.
        let patch = json!([{
            "op": "replace",
            "path": "/",
            "value": { "state": "ACTIVE" }
        }]);
        let (status, json) = self
            .call(
                Method::PATCH,
                Some(&access_token),
                "payments/billing-plans",
                Some(&plan_id),
                Body::Json(&patch),
            )
            .await?;
        if status != 200 {
            extract_error_from_json(Some(dict), &json);
            bail!("create_plan: error setting to active: status={status}");
        }
        info!("paypal: new plan '{plan_name}' with id '{plan_id}' activated");

        dict.put("_plan-id", &plan_id);
        Ok(())
    }

    /// PPCHECKOUT prepare for recurring donations: create a billing
    /// agreement under the plan from
    /// [`find_create_plan`](Self::find_create_plan) and park the state in
    /// the session.
    pub async fn create_subscription(
        &self,
        sessions: &SessionStore,
        accounts: &AccountDb,
        dict: &mut Dict,
    ) -> anyhow::Result<()> {
        let plan_id = dict.get_str("_plan-id").to_string();
        if plan_id.is_empty() {
            bail!("missing '_plan-id'");
        }
        let plan_name = dict.get_str("_plan-name").to_string();
        if plan_name.is_empty() {
            bail!("missing '_plan-name'");
        }
        let email = dict.get_str("Email").to_string();
        if email.is_empty() {
            bail!("missing 'Email'");
        }
        let return_url = get_url(dict, "Return-Url")?;
        let cancel_url = get_url(dict, "Cancel-Url")?;
        if dict.get_int("Recur") == 0 {
            bail!("missing 'Recur'");
        }

        let desc = match dict.get("Desc").filter(|s| !s.is_empty()) {
            Some(desc) => sanitize_desc(desc),
            None => sanitize_desc(&format!("Subscription using plan {plan_name}")),
        };

        let sessid = dict.get_str("Session-Id").to_string();
        if sessid.is_empty() {
            bail!("missing 'Session-Id'");
        }
        let aliasid = sessions.create_alias(&sessid)?;

        let access_token = self.get_access_token().await?;
        let account_id = accounts.new_record()?;

        // The start date must lie on the next day.
        let start_date = (chrono::Utc::now() + chrono::Duration::seconds(64_400))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();

        let request = json!({
            "name": format!("Subscription {plan_name} ({account_id})"),
            "description": desc,
            "start_date": start_date,
            "plan": { "id": plan_id },
            "payer": {
                "payment_method": "paypal",
                "payer_info": { "email": email }
            },
            "override_merchant_preferences": {
                "cancel_url": cancel_url,
                "return_url": with_aliasid(&return_url, &aliasid),
            }
        });
        let (status, json) = self
            .call(
                Method::POST,
                Some(&access_token),
                "payments/billing-agreements",
                None,
                Body::Json(&request),
            )
            .await?;
        if !matches!(status, 200 | 201) {
            extract_error_from_json(Some(dict), &json);
            bail!("error sending payment: status={status}");
        }

        let approval = find_link(&json, "approval_url")
            .ok_or_else(|| anyhow!("HATEOAS:approval_url missing in result"))?;
        dict.put("Redirect-Url", approval);

        let execute = find_link(&json, "execute")
            .ok_or_else(|| anyhow!("HATEOAS:execute missing in result"))?;

        // Park everything execute will need in the session.
        let mut state = Dict::new();
        state.put("_paypal:hateoas:execute", execute);
        state.put("_paypal:plan_id", &plan_id);
        state.put("_paypal:plan_name", &plan_name);
        state.put("_paypal:access_token", &access_token);
        state.put("_paypal:account_id", &account_id);
        backup_meta(&mut state, dict);
        backup_field(&mut state, dict, "Amount");
        backup_field(&mut state, dict, "Currency");
        backup_field(&mut state, dict, "Desc");
        backup_field(&mut state, dict, "Recur");
        sessions.put(&sessid, &state)?;
        Ok(())
    }

    /// PPCHECKOUT prepare for one-shot payments.
    pub async fn checkout_prepare(
        &self,
        sessions: &SessionStore,
        dict: &mut Dict,
    ) -> anyhow::Result<()> {
        let return_url = get_url(dict, "Return-Url")?;
        let cancel_url = get_url(dict, "Cancel-Url")?;

        // Currency and Amount have been validated by the command layer.
        let currency = dict.get_str("Currency").to_string();
        let amount = dict.get_str("Amount").to_string();
        let desc = match dict.get("Desc").filter(|s| !s.is_empty()) {
            Some(desc) => sanitize_desc(desc),
            None => sanitize_desc(&format!("Payment of {amount} {currency}")),
        };

        let sessid = dict.get_str("Session-Id").to_string();
        if sessid.is_empty() {
            bail!("missing 'Session-Id'");
        }
        let aliasid = sessions.create_alias(&sessid)?;

        let access_token = self.get_access_token().await?;

        let mut request = json!({
            "transactions": [{
                "amount": { "currency": currency, "total": amount },
                "description": desc
            }],
            "payer": { "payment_method": "paypal" },
            "intent": "sale",
            "redirect_urls": {
                "cancel_url": cancel_url,
                "return_url": with_aliasid(&return_url, &aliasid),
            }
        });
        // Optional PayPal experience profile.
        if let Some(xp) = dict.get("Paypal-Xp").filter(|s| !s.is_empty() && !s.contains('"')) {
            request["experience_profile_id"] = Value::String(xp.to_string());
        }

        let (status, json) = self
            .call(
                Method::POST,
                Some(&access_token),
                "payments/payment",
                None,
                Body::Json(&request),
            )
            .await?;
        if !matches!(status, 200 | 201) {
            extract_error_from_json(Some(dict), &json);
            bail!("error sending payment: status={status}");
        }

        let payment_id = json
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("payment id missing in result"))?;
        let approval = find_link(&json, "approval_url")
            .ok_or_else(|| anyhow!("approval_url missing in result"))?;
        dict.put("Redirect-Url", approval);

        let mut state = Dict::new();
        state.put("_paypal:id", payment_id);
        state.put("_paypal:access_token", &access_token);
        backup_meta(&mut state, dict);
        backup_field(&mut state, dict, "Amount");
        backup_field(&mut state, dict, "Currency");
        backup_field(&mut state, dict, "Desc");
        backup_field(&mut state, dict, "Recur");
        sessions.put(&sessid, &state)?;
        Ok(())
    }

    /// PPCHECKOUT execute: resolve the alias, destroy it so the call is
    /// one-shot, restore the parked state, and execute the payment or
    /// agreement.
    pub async fn checkout_execute(
        &self,
        sessions: &SessionStore,
        accounts: &AccountDb,
        dict: &mut Dict,
    ) -> anyhow::Result<()> {
        // Resolve the state and burn the alias so a replayed Return-Url
        // cannot execute twice.
        let aliasid = dict.get_str("Alias-Id").to_string();
        let sessid = sessions.get_sessid(&aliasid)?;
        sessions.destroy_alias(&aliasid)?;
        let state = sessions.get(&sessid)?;

        // Subscriptions carry the execute URL from the agreement; the
        // one-shot flow falls back to the payment id.
        let hateoas_execute = state.get("_paypal:hateoas:execute");
        let paypal_id = state.get_str("_paypal:id").to_string();
        if hateoas_execute.is_none() && paypal_id.is_empty() {
            bail!("missing payment id in session state");
        }
        let account_id = match hateoas_execute {
            Some(_) => state.get_str("_paypal:account_id").to_string(),
            None => String::new(),
        };
        let access_token = state.get_str("_paypal:access_token").to_string();
        if access_token.is_empty() {
            bail!("missing access token in session state");
        }

        // Restore the fields from the prepare command.
        restore_meta(dict, &state);
        restore_field(dict, &state, "_Amount");
        restore_field(dict, &state, "_Currency");
        restore_field(dict, &state, "_Desc");
        restore_field(dict, &state, "_Recur");

        let (status, json) = match state.get("_paypal:hateoas:execute") {
            Some(execute_url) => {
                // Some empty payload is required.
                let empty = json!({});
                self.call(
                    Method::POST,
                    Some(&access_token),
                    execute_url,
                    None,
                    Body::Json(&empty),
                )
                .await?
            }
            None => {
                let payer = dict.get_str("Paypal-Payer").to_string();
                if payer.is_empty() {
                    bail!("missing 'Paypal-Payer'");
                }
                let body = json!({ "payer_id": payer });
                let method = format!("payments/payment/{paypal_id}/execute");
                self.call(Method::POST, Some(&access_token), &method, None, Body::Json(&body))
                    .await?
            }
        };
        if !matches!(status, 200 | 201) {
            extract_error_from_json(Some(dict), &json);
            bail!("error executing payment: status={status}");
        }

        if state.get("_paypal:hateoas:execute").is_some() {
            let subscription_id = json
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("subscription id missing in result"))?;
            dict.put("Charge-Id", subscription_id);
            dict.remove("balance-transaction");
        } else {
            dict.put("Charge-Id", &paypal_id);
            let sale_id = find_sale_id(&json)
                .ok_or_else(|| anyhow!("sale id missing in result"))?;
            // PayPal's sale id goes into the transaction id field.
            dict.put("balance-transaction", sale_id);
        }

        // Take the payer's mail address from PayPal, not from the client.
        match find_email(&json) {
            Some(email) => dict.put("Email", email),
            None => dict.remove("Email"),
        }

        // A subscription has an account row to update.
        if !account_id.is_empty() {
            let mut accountdict = Dict::new();
            if let Some(email) = dict.get("Email") {
                accountdict.put("Email", email);
            }
            accountdict.put("account-id", &account_id);
            if let Some(payer_id) = find_payer_id(&json) {
                accountdict.put("_paypal_payer_id", payer_id);
            }
            accounts.update_record(&accountdict)?;
            dict.put("account-id", &account_id);
        }

        dict.put("Live", if self.livemode { "t" } else { "f" });
        Ok(())
    }

    /// Echo an IPN payload back to PayPal for validation.  Returns true
    /// only for the literal `VERIFIED` answer.
    pub async fn verify_ipn(&self, live: bool, request: &str) -> anyhow::Result<bool> {
        let url = if live { &self.webscr_url } else { &self.webscr_sandbox_url };
        let body = format!("cmd=_notify-validate&{request}");
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .with_context(|| format!("error accessing '{url}'"))?;
        if response.status().as_u16() != 200 {
            bail!("ipn verification: status={}", response.status());
        }
        let text = response.text().await?;
        Ok(text.lines().next() == Some("VERIFIED"))
    }
}

// --- Session state carry-over helpers --- //

/// Copy all non-empty `Meta[...]` items into TARGET with a `_` prefix.
fn backup_meta(target: &mut Dict, dict: &Dict) {
    for (name, value) in dict.iter() {
        if name.starts_with("Meta[") && !value.is_empty() {
            target.put(&format!("_{name}"), value);
        }
    }
}

fn backup_field(target: &mut Dict, dict: &Dict, name: &str) {
    target.put(&format!("_{name}"), dict.get_str(name));
}

/// Copy all non-empty `_Meta[...]` items into DICT without the prefix.
fn restore_meta(dict: &mut Dict, state: &Dict) {
    for (name, value) in state.iter() {
        if name.starts_with("_Meta[") && !value.is_empty() {
            dict.put(&name[1..], value);
        }
    }
}

fn restore_field(dict: &mut Dict, state: &Dict, name: &str) {
    dict.put(&name[1..], state.get_str(name));
}

// --- Request composition helpers --- //

/// Fetch a URL valued item and make sure it cannot break out of a JSON
/// string.
fn get_url(dict: &Dict, name: &str) -> anyhow::Result<String> {
    let s = dict.get_str(name);
    if s.is_empty() || s.contains('"') {
        bail!("bad or missing '{name}'");
    }
    Ok(s.to_string())
}

/// Append the alias to the return URL so the execute step can find the
/// parked state again.
fn with_aliasid(return_url: &str, aliasid: &str) -> String {
    let sep = if return_url.contains('?') { '&' } else { '?' };
    format!("{return_url}{sep}aliasid={aliasid}")
}

/// PayPal limits descriptions to 126 characters and they must be
/// quote-free.
fn sanitize_desc(desc: &str) -> String {
    let desc: String = desc
        .chars()
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();
    if desc.chars().count() > 126 {
        let head: String = desc.chars().take(122).collect();
        format!("{head} ...")
    } else {
        desc
    }
}

// --- JSON traversal helpers --- //

/// Find the href of the HATEOAS link with the given rel.
fn find_link<'a>(json: &'a Value, rel: &str) -> Option<&'a str> {
    json.get("links")?
        .as_array()?
        .iter()
        .find(|item| item.get("rel").and_then(Value::as_str) == Some(rel))?
        .get("href")?
        .as_str()
}

/// Extract the first sale id from `transactions[].related_resources[]`.
fn find_sale_id(json: &Value) -> Option<&str> {
    for tx in json.get("transactions")?.as_array()? {
        let Some(resources) = tx.get("related_resources").and_then(Value::as_array) else {
            continue;
        };
        for resource in resources {
            if let Some(id) = resource.pointer("/sale/id").and_then(Value::as_str) {
                return Some(id);
            }
        }
    }
    None
}

fn find_email(json: &Value) -> Option<&str> {
    json.pointer("/payer/payer_info/email").and_then(Value::as_str)
}

fn find_payer_id(json: &Value) -> Option<&str> {
    json.pointer("/payer/payer_info/payer_id").and_then(Value::as_str)
}

/// Copy PayPal's error designation into the reply dictionary.
fn extract_error_from_json(dict: Option<&mut Dict>, json: &Value) {
    let Some(kind) = json.get("error").and_then(Value::as_str) else {
        warn!("paypal: no proper error object returned");
        return;
    };
    let mesg = json
        .get("error_description")
        .and_then(Value::as_str)
        .unwrap_or("");
    info!("paypal: error: type='{kind}' mesg='{mesg:.100}'");
    if let Some(dict) = dict {
        dict.put("failure", kind);
        if !mesg.is_empty() {
            dict.put("failure-mesg", mesg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> PaypalClient {
        PaypalClient::with_urls(
            server.url(),
            format!("{}/cgi-bin/webscr", server.url()),
            format!("{}/sandbox/cgi-bin/webscr", server.url()),
            "client:secret",
            false,
            false,
        )
    }

    #[test]
    fn hateoas_prefix_trimming() {
        let prefix = "https://api.paypal.com/v1/";
        // Same host: the prefix is skipped.
        assert_eq!(
            trim_own_prefix(prefix, "https://api.paypal.com/v1/payments/payment", false),
            "payments/payment"
        );
        // Cross host URLs are left alone (and will be resolved below our
        // own prefix, i.e. never leave the configured host).
        assert_eq!(
            trim_own_prefix(prefix, "https://evil.example/v1/payments", false),
            "https://evil.example/v1/payments"
        );
        // With a trailing id the method is never treated as a URL.
        assert_eq!(
            trim_own_prefix(prefix, "https://api.paypal.com/v1/x", true),
            "https://api.paypal.com/v1/x"
        );
    }

    #[test]
    fn description_sanitizing() {
        assert_eq!(sanitize_desc(r#"say "hi""#), "say 'hi'");
        let long = "x".repeat(200);
        let out = sanitize_desc(&long);
        assert_eq!(out.chars().count(), 126);
        assert!(out.ends_with(" ..."));
        assert_eq!(sanitize_desc("short"), "short");
    }

    #[test]
    fn return_url_gets_aliasid() {
        assert_eq!(with_aliasid("https://x/cb", "A1"), "https://x/cb?aliasid=A1");
        assert_eq!(
            with_aliasid("https://x/cb?s=1", "A1"),
            "https://x/cb?s=1&aliasid=A1"
        );
    }

    #[test]
    fn link_and_sale_extraction() {
        let json = serde_json::json!({
            "links": [
                { "rel": "self", "href": "https://api/self" },
                { "rel": "approval_url", "href": "https://paypal/approve" },
                { "rel": "execute", "href": "https://api/execute" }
            ],
            "transactions": [{
                "related_resources": [
                    { "authorization": {} },
                    { "sale": { "id": "SALE42" } }
                ]
            }],
            "payer": { "payer_info": { "email": "p@example.org", "payer_id": "P42" } }
        });
        assert_eq!(find_link(&json, "approval_url"), Some("https://paypal/approve"));
        assert_eq!(find_link(&json, "execute"), Some("https://api/execute"));
        assert_eq!(find_link(&json, "missing"), None);
        assert_eq!(find_sale_id(&json), Some("SALE42"));
        assert_eq!(find_email(&json), Some("p@example.org"));
        assert_eq!(find_payer_id(&json), Some("P42"));
    }

    #[tokio::test]
    async fn access_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"token_type":"Bearer","access_token":"TOK1","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let tok1 = client.get_access_token().await.unwrap();
        let tok2 = client.get_access_token().await.unwrap();
        assert_eq!(tok1, "TOK1");
        assert_eq!(tok2, "TOK1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_401_invalidates_the_token_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"token_type":"Bearer","access_token":"TOK","expires_in":3600}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        client.get_access_token().await.unwrap();
        client.unauthorized_seen.store(true, Ordering::Relaxed);
        client.get_access_token().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn plan_discovery_picks_latest_update() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/billing-plans")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"plans":[
                    {"id":"P-OLD","name":"gnupg-12-5.00-eur","update_time":"2017-01-01T00:00:00.000Z"},
                    {"id":"P-NEW","name":"gnupg-12-5.00-eur","update_time":"2017-05-18T15:47:05.110Z"},
                    {"id":"P-OTHER","name":"gnupg-1-10-usd","update_time":"2018-01-01T00:00:00.000Z"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let id = client
            .find_plan("gnupg-12-5.00-eur", "TOK")
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("P-NEW"));
        let none = client.find_plan("gnupg-4-1-gbp", "TOK").await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn ipn_verification() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sandbox/cgi-bin/webscr")
            .match_body("cmd=_notify-validate&a=1&b=2")
            .with_status(200)
            .with_body("VERIFIED")
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(client.verify_ipn(false, "a=1&b=2").await.unwrap());

        server
            .mock("POST", "/sandbox/cgi-bin/webscr")
            .with_status(200)
            .with_body("INVALID")
            .create_async()
            .await;
        assert!(!client.verify_ipn(false, "x=y").await.unwrap());
    }
}
