//! PPCHECKOUT against a mocked PayPal endpoint: prepare parks state in an
//! aliased session, execute restores it, and the alias is burned so a
//! replayed Return-Url cannot execute twice.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use payprocd::account::AccountDb;
use payprocd::cli::Config;
use payprocd::commands::serve_connection;
use payprocd::context::Daemon;
use payprocd::encrypt::PlainEncryptor;
use payprocd::keyvalue::Dict;
use payprocd::paypal::PaypalClient;
use payprocd::preorder::PreorderDb;
use payprocd::protocol::{read_response, Status};
use payprocd::stripe::StripeClient;

const UID: u32 = 1000;

fn paypal_ctx(server: &mockito::ServerGuard) -> Arc<Daemon> {
    let preorders = PreorderDb::open_in_memory().unwrap();
    let accounts = AccountDb::open_in_memory(Arc::new(PlainEncryptor)).unwrap();
    let stripe = StripeClient::with_base_url(
        "http://127.0.0.1:1".to_string(),
        "sk_test_dummy".to_string(),
        false,
    );
    let paypal = PaypalClient::with_urls(
        server.url(),
        format!("{}/webscr", server.url()),
        format!("{}/sandbox/webscr", server.url()),
        "client:secret",
        false,
        false,
    );
    Daemon::assemble(Config::default(), preorders, accounts, stripe, paypal)
}

async fn roundtrip(ctx: &Arc<Daemon>, request: &str) -> (Status, Dict) {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let worker = tokio::spawn(serve_connection(ctx.clone(), server, UID));
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    worker.await.unwrap();
    let text = String::from_utf8(response).unwrap();
    let mut reader = BufReader::new(text.as_bytes());
    read_response(&mut reader).await.expect("parsable response")
}

async fn mock_token(server: &mut mockito::ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/v1/oauth2/token")
        .with_status(200)
        .with_body(r#"{"token_type":"Bearer","access_token":"TOK","expires_in":3600}"#)
        .create_async()
        .await
}

#[tokio::test]
async fn prepare_returns_redirect_and_parks_state() {
    let mut server = mockito::Server::new_async().await;
    let _token = mock_token(&mut server).await;
    let payment = server
        .mock("POST", "/v1/payments/payment")
        // The return URL handed to PayPal must carry the alias handle.
        .match_body(mockito::Matcher::Regex(
            r#"aliasid=[ybndrfg8ejkmcpqxot1uwisza345h769]{32}"#.to_string(),
        ))
        .with_status(201)
        .with_body(
            r#"{"id":"PAY-1","links":[
                {"rel":"approval_url","href":"https://paypal.example/approve/PAY-1"},
                {"rel":"execute","href":"https://paypal.example/execute/PAY-1"}
            ]}"#,
        )
        .create_async()
        .await;

    let ctx = paypal_ctx(&server);
    let (status, dict) = roundtrip(
        &ctx,
        "PPCHECKOUT prepare\nAmount: 10.42\nCurrency: EUR\n\
         Return-Url: https://shop.example/cb\nCancel-Url: https://shop.example/cancel\n\
         Meta[Origin]: web\n\n",
    )
    .await;

    assert!(matches!(status, Status::Ok(_)), "got {status:?}");
    assert_eq!(
        dict.get("Redirect-Url"),
        Some("https://paypal.example/approve/PAY-1")
    );
    let sessid = dict.get("_SESSID").expect("new session").to_string();
    payment.assert_async().await;

    // The prepared state is parked in the session, internal items
    // prefixed with an underscore.
    let state = ctx.sessions.get(&sessid).unwrap();
    assert_eq!(state.get("_paypal:id"), Some("PAY-1"));
    assert_eq!(state.get("_paypal:access_token"), Some("TOK"));
    assert_eq!(state.get("_Amount"), Some("10.42"));
    assert_eq!(state.get("_Currency"), Some("EUR"));
    assert_eq!(state.get("_Meta[Origin]"), Some("web"));
}

#[tokio::test]
async fn execute_restores_state_and_burns_the_alias() {
    let mut server = mockito::Server::new_async().await;
    let execute = server
        .mock("POST", "/v1/payments/payment/PAY-7/execute")
        .with_status(200)
        .with_body(
            r#"{"id":"PAY-7",
                "transactions":[{"related_resources":[{"sale":{"id":"SALE-7"}}]}],
                "payer":{"payer_info":{"email":"buyer@example.org","payer_id":"P7"}}}"#,
        )
        .create_async()
        .await;

    let ctx = paypal_ctx(&server);

    // Park the state the way prepare would.
    let sessid = ctx.sessions.create(0, &Dict::new()).unwrap();
    let mut state = Dict::new();
    state.put("_paypal:id", "PAY-7");
    state.put("_paypal:access_token", "TOK");
    state.put("_Amount", "10.42");
    state.put("_Currency", "EUR");
    state.put("_Desc", "Donation");
    state.put("_Meta[Origin]", "web");
    ctx.sessions.put(&sessid, &state).unwrap();
    let aliasid = ctx.sessions.create_alias(&sessid).unwrap();

    let (status, dict) = roundtrip(
        &ctx,
        &format!("PPCHECKOUT execute\nAlias-Id: {aliasid}\nPaypal-Payer: P7\n\n"),
    )
    .await;

    assert!(matches!(status, Status::Ok(_)), "got {status:?}");
    execute.assert_async().await;
    assert_eq!(dict.get("Charge-Id"), Some("PAY-7"));
    assert_eq!(dict.get("Amount"), Some("10.42"));
    assert_eq!(dict.get("Currency"), Some("EUR"));
    assert_eq!(dict.get("Email"), Some("buyer@example.org"));
    assert_eq!(dict.get("Live"), Some("f"));
    assert!(dict.get("_timestamp").is_some());

    // The alias is gone: replaying the Return-Url must fail.
    let (status, _) = roundtrip(
        &ctx,
        &format!("PPCHECKOUT execute\nAlias-Id: {aliasid}\nPaypal-Payer: P7\n\n"),
    )
    .await;
    assert!(matches!(status, Status::Err { .. }));

    // The session itself survives the execute.
    assert!(ctx.sessions.get(&sessid).is_ok());
}
