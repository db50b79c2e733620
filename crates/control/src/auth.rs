//! Registration frame signing.
//!
//! With a shared secret, `register` carries
//! `base64(HMAC-SHA256(secret, "register|identity|ts|nonce"))`. Without one
//! the signature part is empty.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::frame::{WorkerReport, ACTION_REGISTER};

type HmacSha256 = Hmac<Sha256>;

/// Fields of a decoded `register` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub identity: String,
    pub ts: u64,
    pub nonce: String,
    pub signature: String,
}

impl Registration {
    /// Parse the arguments of a `register` frame (`parts[1..]`).
    pub fn from_args(args: &[String]) -> Option<Self> {
        match args {
            [identity, ts, nonce, signature] => Some(Self {
                identity: identity.clone(),
                ts: ts.parse().ok()?,
                nonce: nonce.clone(),
                signature: signature.clone(),
            }),
            _ => None,
        }
    }
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn canonical_body(identity: &str, ts: u64, nonce: &str) -> String {
    format!("{}|{}|{}|{}", ACTION_REGISTER, identity, ts, nonce)
}

fn mac_for(secret: &str, body: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key error");
    mac.update(body.as_bytes());
    mac
}

pub fn sign(identity: &str, ts: u64, nonce: &str, secret: &str) -> String {
    let sig = mac_for(secret, &canonical_body(identity, ts, nonce))
        .finalize()
        .into_bytes();
    general_purpose::STANDARD.encode(sig)
}

pub fn verify(registration: &Registration, secret: &str) -> bool {
    let Ok(provided) = general_purpose::STANDARD.decode(registration.signature.as_bytes()) else {
        return false;
    };
    let body = canonical_body(&registration.identity, registration.ts, &registration.nonce);
    mac_for(secret, &body).verify_slice(&provided).is_ok()
}

/// Build the `register` frame for `identity`, signed when `secret` is set.
pub fn registration_report(identity: &str, secret: Option<&str>) -> WorkerReport {
    let ts = now_ts();
    let nonce = Uuid::new_v4().to_string();
    let signature = secret
        .map(|secret| sign(identity, ts, &nonce, secret))
        .unwrap_or_default();
    WorkerReport::Register {
        identity: identity.to_string(),
        ts,
        nonce,
        signature,
    }
}
