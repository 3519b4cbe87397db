//! Automation orchestration engine.
//!
//! Runs time-boxed end-to-end tests of the billing-data ingestion pipeline:
//! synthetic accounts write rows for a while, then the row counts seen by the
//! three downstream copies are compared and the verdict is reported.
//!
//! | Module         | Responsibility                                              |
//! |----------------|-------------------------------------------------------------|
//! | `models`       | Persisted documents and request bodies                      |
//! | `store`        | Versioned document store with bounded-retry transactions    |
//! | `identity`     | Worker-identity pool with per-identity capacity             |
//! | `jobs`         | Copy-job contract and stuck classification                  |
//! | `services`     | Row counts, table provisioning, pipeline side effects       |
//! | `task`         | One write iteration for one account                         |
//! | `dispatch`     | Fan-out of task requests (inline or over HTTP)              |
//! | `manager`      | Stage machine advanced one step per invocation              |
//! | `orchestrator` | Create, stop and tear down orchestration runs               |
//! | `notify`       | Result notifications                                        |
//! | `simulated`    | In-process warehouse and identity provider                  |
//! | `engine`       | Wiring                                                      |
//! | `api`/`server` | HTTP surface                                                |

pub mod api;
pub mod dispatch;
pub mod engine;
pub mod identity;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod server;
pub mod services;
pub mod simulated;
pub mod store;
pub mod task;

pub use engine::{Collaborators, Engine, EngineStatus};
pub use manager::StepReport;
pub use orchestrator::TeardownReport;
