//! HTTP-Redirect and HTTP-POST bindings.
//!
//! Redirect messages are DEFLATE-compressed, base64-encoded and carried in
//! the query string; their signature covers the encoded query parameters
//! rather than the XML. POST messages are plain base64 and carry an enveloped
//! XML signature instead.

use std::{fmt, io::Read, io::Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::{
    crypto::{SignatureAlgorithm, SigningKey},
    error::SamlError,
};

/// Largest encoded message accepted from a client.
pub const MAX_ENCODED_SIZE: usize = 512 * 1024;

/// Largest inflated redirect payload.
pub const MAX_INFLATED_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    #[default]
    Redirect,
    Post,
}

impl Binding {
    pub fn uri(&self) -> &'static str {
        match self {
            Binding::Redirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            Binding::Post => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Some(Binding::Redirect),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Some(Binding::Post),
            _ => None,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Redirect => f.write_str("redirect"),
            Binding::Post => f.write_str("post"),
        }
    }
}

impl std::str::FromStr for Binding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redirect" => Ok(Binding::Redirect),
            "post" => Ok(Binding::Post),
            other => Err(format!("unknown binding: {other}")),
        }
    }
}

/// Which protocol parameter a message travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageField {
    Request,
    Response,
}

impl MessageField {
    pub fn param(&self) -> &'static str {
        match self {
            MessageField::Request => "SAMLRequest",
            MessageField::Response => "SAMLResponse",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// DEFLATE then base64, for the Redirect binding.
pub fn deflate_encode(xml: &str) -> Result<String, SamlError> {
    let mut compressed = Vec::new();
    {
        let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
        encoder
            .write_all(xml.as_bytes())
            .map_err(|e| SamlError::Internal(format!("Failed to compress message: {e}")))?;
        encoder
            .finish()
            .map_err(|e| SamlError::Internal(format!("Failed to compress message: {e}")))?;
    }
    Ok(STANDARD.encode(compressed))
}

/// Reverse of [`deflate_encode`], bounded by [`MAX_INFLATED_SIZE`].
pub fn inflate_decode(encoded: &str) -> Result<String, SamlError> {
    let compressed = decode_base64(encoded)?;
    let mut decoder = DeflateDecoder::new(compressed.as_slice()).take(MAX_INFLATED_SIZE as u64 + 1);
    let mut xml = Vec::new();
    decoder
        .read_to_end(&mut xml)
        .map_err(|e| SamlError::Decode(format!("invalid DEFLATE data: {e}")))?;
    if xml.len() > MAX_INFLATED_SIZE {
        return Err(SamlError::Decode("inflated message too large".into()));
    }
    String::from_utf8(xml).map_err(|_| SamlError::Decode("message is not UTF-8".into()))
}

/// Base64 for the POST binding.
pub fn post_encode(xml: &str) -> String {
    STANDARD.encode(xml.as_bytes())
}

/// Reverse of [`post_encode`]. Line breaks inserted by IdPs are ignored.
pub fn post_decode(encoded: &str) -> Result<String, SamlError> {
    let bytes = decode_base64(encoded)?;
    String::from_utf8(bytes).map_err(|_| SamlError::Decode("message is not UTF-8".into()))
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, SamlError> {
    if encoded.len() > MAX_ENCODED_SIZE {
        return Err(SamlError::Decode("message too large".into()));
    }
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(SamlError::Decode("empty message".into()));
    }
    STANDARD
        .decode(compact)
        .map_err(|e| SamlError::Decode(format!("invalid base64: {e}")))
}

/// Build a Redirect-binding URL, signing the query when a key is given.
///
/// The signature covers `SAMLRequest=..&RelayState=..&SigAlg=..` exactly as
/// encoded in the URL. Any query already on `destination` is preserved ahead
/// of the SAML parameters and is not signed.
pub fn redirect_url(
    destination: &str,
    field: MessageField,
    xml: &str,
    relay_state: Option<&str>,
    signer: Option<(&SigningKey, SignatureAlgorithm)>,
) -> Result<String, SamlError> {
    let payload = deflate_encode(xml)?;

    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair(field.param(), &payload);
    if let Some(relay_state) = relay_state {
        query.append_pair("RelayState", relay_state);
    }
    if let Some((_, algorithm)) = signer {
        query.append_pair("SigAlg", algorithm.uri());
    }
    let mut query = query.finish();

    if let Some((key, algorithm)) = signer {
        let signature = key
            .sign(algorithm, query.as_bytes())
            .map_err(|e| SamlError::Configuration(format!("Failed to sign redirect: {e}")))?;
        let encoded = form_urlencoded::Serializer::new(String::new())
            .append_pair("Signature", &STANDARD.encode(signature))
            .finish();
        query.push('&');
        query.push_str(&encoded);
    }

    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{destination}{separator}{query}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound messages
// ─────────────────────────────────────────────────────────────────────────────

/// A message received over the Redirect binding.
///
/// The raw, still-encoded query components are retained because the
/// signature is computed over them, not over their decoded values.
#[derive(Debug, Clone)]
pub struct RedirectMessage {
    pub field: MessageField,
    pub payload: String,
    pub relay_state: Option<String>,
    pub sig_alg: Option<String>,
    pub signature: Option<String>,
    signed_octets: String,
}

impl RedirectMessage {
    pub fn from_query(query: &str) -> Result<Self, SamlError> {
        if query.len() > MAX_ENCODED_SIZE {
            return Err(SamlError::Decode("query string too large".into()));
        }

        let mut message: Option<(MessageField, &str)> = None;
        let mut relay_state: Option<&str> = None;
        let mut sig_alg: Option<&str> = None;
        let mut signature: Option<&str> = None;

        for part in query.trim_start_matches('?').split('&') {
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            let slot = match name {
                "SAMLRequest" | "SAMLResponse" => {
                    if message.is_some() {
                        return Err(SamlError::Decode("duplicate SAML parameter".into()));
                    }
                    let field = if name == "SAMLRequest" {
                        MessageField::Request
                    } else {
                        MessageField::Response
                    };
                    message = Some((field, value));
                    continue;
                }
                "RelayState" => &mut relay_state,
                "SigAlg" => &mut sig_alg,
                "Signature" => &mut signature,
                _ => continue,
            };
            if slot.replace(value).is_some() {
                return Err(SamlError::Decode(format!("duplicate {name} parameter")));
            }
        }

        let (field, raw_payload) =
            message.ok_or_else(|| SamlError::Decode("missing SAMLRequest or SAMLResponse".into()))?;

        let mut signed_octets = format!("{}={raw_payload}", field.param());
        if let Some(raw) = relay_state {
            signed_octets.push_str(&format!("&RelayState={raw}"));
        }
        if let Some(raw) = sig_alg {
            signed_octets.push_str(&format!("&SigAlg={raw}"));
        }

        Ok(Self {
            field,
            payload: url_decode(raw_payload),
            relay_state: relay_state.map(url_decode),
            sig_alg: sig_alg.map(url_decode),
            signature: signature.map(url_decode),
            signed_octets,
        })
    }

    /// The exact bytes a Redirect-binding signature covers.
    pub fn signed_octets(&self) -> &[u8] {
        self.signed_octets.as_bytes()
    }

    pub fn xml(&self) -> Result<String, SamlError> {
        inflate_decode(&self.payload)
    }
}

fn url_decode(raw: &str) -> String {
    form_urlencoded::parse(format!("v={raw}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// A message received at the ACS or SLS endpoint.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Redirect(RedirectMessage),
    Post {
        field: MessageField,
        payload: String,
        relay_state: Option<String>,
    },
}

impl InboundMessage {
    pub fn from_query(query: &str) -> Result<Self, SamlError> {
        RedirectMessage::from_query(query).map(InboundMessage::Redirect)
    }

    pub fn post(field: MessageField, payload: impl Into<String>, relay_state: Option<String>) -> Self {
        InboundMessage::Post {
            field,
            payload: payload.into(),
            relay_state,
        }
    }

    pub fn field(&self) -> MessageField {
        match self {
            InboundMessage::Redirect(m) => m.field,
            InboundMessage::Post { field, .. } => *field,
        }
    }

    pub fn relay_state(&self) -> Option<&str> {
        match self {
            InboundMessage::Redirect(m) => m.relay_state.as_deref(),
            InboundMessage::Post { relay_state, .. } => relay_state.as_deref(),
        }
    }

    pub fn binding(&self) -> Binding {
        match self {
            InboundMessage::Redirect(_) => Binding::Redirect,
            InboundMessage::Post { .. } => Binding::Post,
        }
    }

    /// Decode the XML payload.
    pub fn xml(&self) -> Result<String, SamlError> {
        match self {
            InboundMessage::Redirect(m) => m.xml(),
            InboundMessage::Post { payload, .. } => post_decode(payload),
        }
    }
}
