//! # Org Harvest
//!
//! **A Salesforce schema extraction and vector-corpus ingestion pipeline.**
//!
//! Org Harvest walks a Salesforce org through the authenticated `sf` CLI,
//! assembles a complete per-object representation (schema, automation,
//! security model, usage statistics) and publishes it as a chunked corpus
//! to an external vector index for retrieval-augmented question answering.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────────────────────┐   ┌────────────┐
//! │ Enumerator │──▶│ Describer ‖ Enrichers      │──▶│  Emitter    │
//! └────────────┘   │  (coalesce → retry →       │   │  md + jsonl │
//!                  │   limiter → sf CLI,        │   └─────┬──────┘
//!                  │   cache short-circuit)     │         ▼
//!                  └────────────────────────────┘   ┌────────────┐
//!                                                   │  Uploader   │
//!                                                   │ embed+index │
//!                                                   └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **enumerator** ([`enumerate`]) lists queryable objects and applies
//!    the noise and namespace filters.
//! 2. The **describer** ([`describe`]) fetches field metadata per object
//!    through a bounded worker pool and builds [`models::ObjectRecord`]s.
//! 3. **Enrichers** attach optional blocks: usage statistics
//!    ([`enrich_stats`]), automation references ([`enrich_automation`]),
//!    field-level security ([`enrich_security`]), field audit history
//!    ([`enrich_history`]), and org-wide security ([`enrich_org_security`]).
//! 4. Every remote call flows through the **query coalescer**
//!    ([`coalesce`]) where batching is possible, then the **retry engine**
//!    ([`retry`]), the global **rate limiter** ([`limiter`]), and the **CLI
//!    bridge** ([`bridge`]), with the **cache** ([`cache`]) short-circuiting
//!    repeat queries.
//! 5. The **emitter** ([`emit`]) renders markdown, chunks it ([`chunk`]),
//!    and writes `schema.json` plus `corpus.jsonl`.
//! 6. The **uploader** ([`upload`]) diffs content hashes against the vector
//!    index ([`index`]) and upserts only what changed, embedding through
//!    [`embedding`].
//!
//! Progress is persisted per object and phase ([`progress`]) so a run
//! stopped by the daily API quota resumes exactly where it halted.

pub mod bridge;
pub mod cache;
pub mod chunk;
pub mod coalesce;
pub mod config;
pub mod describe;
pub mod embedding;
pub mod emit;
pub mod enrich_automation;
pub mod enrich_history;
pub mod enrich_org_security;
pub mod enrich_security;
pub mod enrich_stats;
pub mod enumerate;
pub mod index;
pub mod limiter;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod session;
pub mod upload;
