//! Asynchronous processing of PayPal Instant Payment Notifications.
//!
//! The PPIPNHD handler answers `OK` and closes the socket *before* this
//! code runs, so PayPal does not re-deliver the notification while we
//! are still verifying it.  Authenticity is established by echoing the
//! payload back to PayPal with `cmd=_notify-validate`.

use std::sync::Arc;

use tracing::{error, info};

use crate::context::Daemon;
use crate::keyvalue::{parse_www_form_urlencoded, Dict};

/// Validate and process one notification.  Runs as a detached task; the
/// context's semaphore bounds how many verifications are in flight.
pub async fn process_notification(ctx: Arc<Daemon>, mut dict: Dict) {
    let _permit = match ctx.ipn_slots.acquire().await {
        Ok(permit) => permit,
        Err(_) => return, // shutting down
    };

    // The CGI shim delivers the raw POST body as the Request item; line
    // continuation may have sprinkled newlines into it.
    dict.remove_nl("Request");
    let Some(request) = dict.snatch("Request").filter(|r| !r.is_empty()) else {
        error!("ppipnhd: no request given");
        return;
    };
    info!("ppipnhd: length of request={}", request.len());

    let form = match parse_www_form_urlencoded(&request) {
        Ok(form) => form,
        Err(err) => {
            error!("ppipnhd: error parsing request: {err}");
            return;
        }
    };

    // Check the receiving mailbox first to avoid a useless verification
    // round-trip for misdirected notifications.
    let receiver = form.get_str("receiver_email");
    if receiver != ctx.cfg.paypal_mailbox {
        error!("ppipnhd: wrong receiver_email");
        error!("  mail={receiver}");
        return;
    }

    let live = form.get_int("test_ipn") == 0;
    match ctx.paypal.verify_ipn(live, &request).await {
        Ok(true) => info!("ppipnhd: IPN accepted"),
        Ok(false) => error!("ppipnhd: IPN is not authentic"),
        Err(err) => error!("ppipnhd: error verifying IPN: {err:#}"),
    }
}
