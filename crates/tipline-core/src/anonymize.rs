//! Sender anonymization and unlinkable response routing.
//!
//! Accepts whistleblower-style reports with no sender reference at all:
//! the case record carries a random case ID, a generalized location, and a
//! category - never a reporter identifier, device identifier, or precise
//! location. Responses route back over the case ID alone.
//!
//! ## Unlinkability
//!
//! - Case IDs come from the environment RNG; they are not sequential, not
//!   time-derived, and share no derivation with any sender attribute, so
//!   two submissions by the same (unknown) sender cannot be correlated
//!   lexically
//! - Submission processing sleeps a random jitter before the case record
//!   is written, breaking temporal correlation between ingress and record
//!   timestamps
//! - Reporter-side aliases (`anon_*`) and responder-side aliases
//!   (`coord_*`) are independently random; no shared derivation permits
//!   linking one to the other
//!
//! ## Multi-hop separation
//!
//! Delivery is modeled as a relay chain. The ingress hop logs the
//! reporter's transport alias but never the payload; every later hop logs
//! the payload reference but never the alias. No single hop record
//! contains both.

use std::sync::Arc;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    audit::AuditLog,
    env::Environment,
    error::CoreError,
    store::{self, Store, StoreError, WriteOp, retry},
};

/// Collection holding case records.
const CASES_COLLECTION: &str = "cases";

/// Collection holding case payloads, keyed by case ID (no sender data).
const CONTENT_COLLECTION: &str = "case_content";

/// Collection holding per-hop relay logs.
const HOPS_COLLECTION: &str = "case_hops";

/// Collection holding routed responses.
const RESPONSES_COLLECTION: &str = "case_responses";

/// Upper bound on the randomized submission-processing jitter.
const MAX_SUBMIT_JITTER_MS: u64 = 250;

/// A location as reported by a submitter, before generalization.
///
/// Only ever held transiently during submission; the precise fields are
/// dropped and never persisted.
#[derive(Debug, Clone, Default)]
pub struct ReportedLocation {
    /// Coarse administrative unit (state, province, region)
    pub region: Option<String>,
    /// City - dropped during generalization
    pub city: Option<String>,
    /// Street-level address - dropped during generalization
    pub street_address: Option<String>,
    /// Precise coordinates - dropped during generalization
    pub coordinates: Option<(f64, f64)>,
    /// Device identifier - dropped during generalization
    pub device_id: Option<String>,
}

/// An anonymous case record.
///
/// Invariant: contains no reporter identifier, no device identifier, and
/// no location finer than a coarse administrative unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymousCase {
    /// Random, unlinkable case ID
    pub case_id: String,
    /// Region-level location, or `"unspecified"`
    pub generalized_location: String,
    /// Report category
    pub category: String,
    /// When the case record was created (epoch millis, post-jitter)
    pub created_at: u64,
    /// Responder alias (`coord_*`), set once a response is routed
    pub responder_anonymous_id: Option<String>,
}

/// A response routed back to a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResponse {
    /// Random response ID
    pub response_id: String,
    /// Case this response belongs to
    pub case_id: String,
    /// Responder alias (`coord_*`), independent of any reporter alias
    pub responder_alias: String,
    /// Response body
    pub content: Vec<u8>,
    /// When the response was routed (epoch millis)
    pub created_at: u64,
}

/// One hop in the relay chain.
///
/// Invariant: `transport_alias` and `payload_ref` are never both set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayHop {
    case_id: String,
    hop: u8,
    /// Reporter transport alias (`anon_*`); ingress hop only
    transport_alias: Option<String>,
    /// Reference to the payload record; relay hops only
    payload_ref: Option<String>,
    logged_at: u64,
}

/// Payload record, stored apart from any sender data.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CasePayload {
    case_id: String,
    content: Vec<u8>,
}

/// Strips identity from submissions and routes unlinkable responses.
pub struct AnonymizationProxy<E, S> {
    env: E,
    store: S,
    audit: Arc<AuditLog<E, S>>,
    /// Relay chain length; hop separation only matters above 1
    hops: u8,
    retry: retry::RetryPolicy,
}

impl<E, S> AnonymizationProxy<E, S>
where
    E: Environment,
    S: Store,
{
    /// Create a proxy with the default three-hop relay chain.
    pub fn new(env: E, store: S, audit: Arc<AuditLog<E, S>>) -> Self {
        Self::with_hops(env, store, audit, 3)
    }

    /// Create a proxy with an explicit relay chain length (minimum 1).
    pub fn with_hops(env: E, store: S, audit: Arc<AuditLog<E, S>>, hops: u8) -> Self {
        Self { env, store, audit, hops: hops.max(1), retry: retry::RetryPolicy::default() }
    }

    /// Submit an anonymous report.
    ///
    /// Sleeps a random jitter before creating the case so record
    /// timestamps do not correlate with submission time, then persists the
    /// case, payload, and relay hops in one batch and appends one
    /// `anonymous_submission` audit entry keyed by the case ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationFailed` for an empty report or
    /// category, or `CoreError::Store` if persistence fails after retries.
    pub async fn submit(
        &self,
        content: &[u8],
        category: &str,
        location: ReportedLocation,
    ) -> Result<AnonymousCase, CoreError> {
        if content.is_empty() {
            return Err(CoreError::ValidationFailed { reason: "empty report".to_string() });
        }
        if category.is_empty() {
            return Err(CoreError::ValidationFailed { reason: "empty category".to_string() });
        }

        // Randomized processing delay against temporal correlation
        let jitter = self.env.random_u64() % (MAX_SUBMIT_JITTER_MS + 1);
        self.env.sleep(Duration::from_millis(jitter)).await;

        let case_id = format!("case_{:032x}", self.env.random_u128());
        let transport_alias = format!("anon_{:032x}", self.env.random_u128());
        let now = self.env.now_millis();

        let case = AnonymousCase {
            case_id: case_id.clone(),
            generalized_location: generalize_location(&location),
            category: category.to_string(),
            created_at: now,
            responder_anonymous_id: None,
        };

        let payload_ref = format!("{case_id}/payload");
        let mut ops = vec![
            WriteOp::Put {
                collection: CASES_COLLECTION.to_string(),
                id: case_id.clone(),
                record: store::encode(&case)?,
            },
            WriteOp::Put {
                collection: CONTENT_COLLECTION.to_string(),
                id: case_id.clone(),
                record: store::encode(&CasePayload {
                    case_id: case_id.clone(),
                    content: content.to_vec(),
                })?,
            },
        ];

        // Ingress hop sees the transport alias, never the payload; relay
        // hops see the payload reference, never the alias.
        for hop in 1..=self.hops {
            let record = RelayHop {
                case_id: case_id.clone(),
                hop,
                transport_alias: (hop == 1).then(|| transport_alias.clone()),
                payload_ref: (hop > 1).then(|| payload_ref.clone()),
                logged_at: now,
            };
            ops.push(WriteOp::Put {
                collection: HOPS_COLLECTION.to_string(),
                id: format!("{case_id}/{hop:02}"),
                record: store::encode(&record)?,
            });
        }

        retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let ops = ops.clone();
            async move { store.batch_write(ops).await }
        })
        .await?;

        self.audit
            .append(
                &case_id,
                "anonymous_submission",
                [("category".to_string(), category.to_string())].into_iter().collect(),
            )
            .await?;

        tracing::info!(case = %case_id, category, "anonymous case created");
        Ok(case)
    }

    /// Route a response to a case without linking identities.
    ///
    /// The responder receives only the case ID; the submitter receives
    /// only a fresh `coord_*` alias. Neither direction carries the other
    /// side's identity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationFailed` if the case does not exist or
    /// the response is empty.
    pub async fn route_response(
        &self,
        case_id: &str,
        responder_content: &[u8],
    ) -> Result<CaseResponse, CoreError> {
        if responder_content.is_empty() {
            return Err(CoreError::ValidationFailed { reason: "empty response".to_string() });
        }

        let mut case: AnonymousCase = match self.store.get(CASES_COLLECTION, case_id).await {
            Ok(bytes) => store::decode(&bytes)?,
            Err(StoreError::NotFound { .. }) => {
                return Err(CoreError::ValidationFailed {
                    reason: format!("unknown case {case_id}"),
                });
            },
            Err(err) => return Err(err.into()),
        };

        let responder_alias = format!("coord_{:032x}", self.env.random_u128());
        let response = CaseResponse {
            response_id: format!("resp_{:032x}", self.env.random_u128()),
            case_id: case_id.to_string(),
            responder_alias: responder_alias.clone(),
            content: responder_content.to_vec(),
            created_at: self.env.now_millis(),
        };
        case.responder_anonymous_id = Some(responder_alias);

        let ops = vec![
            WriteOp::Put {
                collection: CASES_COLLECTION.to_string(),
                id: case_id.to_string(),
                record: store::encode(&case)?,
            },
            WriteOp::Put {
                collection: RESPONSES_COLLECTION.to_string(),
                id: format!("{case_id}/{}", response.response_id),
                record: store::encode(&response)?,
            },
        ];

        retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let ops = ops.clone();
            async move { store.batch_write(ops).await }
        })
        .await?;

        tracing::info!(case = %case_id, "response routed");
        Ok(response)
    }

    /// Responses routed to a case so far, oldest first.
    ///
    /// This is how the (unknown) submitter collects replies: they hold the
    /// case ID and nothing else identifies them.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on backend failure.
    pub async fn responses(&self, case_id: &str) -> Result<Vec<CaseResponse>, CoreError> {
        let records = self
            .store
            .query_range(RESPONSES_COLLECTION, &format!("{case_id}/"), &format!("{case_id}/~"))
            .await?;

        let mut responses = Vec::with_capacity(records.len());
        for (_, bytes) in records {
            responses.push(store::decode::<CaseResponse>(&bytes)?);
        }
        responses.sort_by_key(|r| r.created_at);
        Ok(responses)
    }

    /// Load a case record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationFailed` if the case does not exist.
    pub async fn case(&self, case_id: &str) -> Result<AnonymousCase, CoreError> {
        match self.store.get(CASES_COLLECTION, case_id).await {
            Ok(bytes) => Ok(store::decode(&bytes)?),
            Err(StoreError::NotFound { .. }) => {
                Err(CoreError::ValidationFailed { reason: format!("unknown case {case_id}") })
            },
            Err(err) => Err(err.into()),
        }
    }
}

/// Reduce a reported location to a coarse administrative unit.
///
/// Keeps the region; drops city, street address, coordinates, and device
/// identifiers entirely.
fn generalize_location(location: &ReportedLocation) -> String {
    location.region.as_deref().map_or_else(|| "unspecified".to_string(), str::to_string)
}
