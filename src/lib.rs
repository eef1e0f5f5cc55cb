//! Palisade - embeddable access-control decision engine
//!
//! A declarative model describes the shape of requests, policy rules, role
//! hierarchies, matcher expressions and effect combining; a population of
//! rules then answers "is this request permitted?". Decisions are synchronous
//! and in-memory; persistence goes through an [`Adapter`].
//!
//! ```
//! use palisade::{Enforcer, Model};
//!
//! let model = Model::from_str(r#"
//! [request_definition]
//! r = sub, obj, act
//! [policy_definition]
//! p = sub, obj, act
//! [policy_effect]
//! e = some(where (p.eft == allow))
//! [matchers]
//! m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
//! "#).unwrap();
//!
//! let mut enforcer = Enforcer::from_model(model);
//! enforcer.add_rule(["p", "alice", "data1", "read"]).unwrap();
//! assert!(enforcer.enforce(["alice", "data1", "read"]).unwrap());
//! assert!(!enforcer.enforce(["alice", "data1", "write"]).unwrap());
//! ```

pub mod adapter;
pub mod config;
pub mod defs;
pub mod effector;
pub mod enforcer;
pub mod errors;
pub mod expr;
pub mod matcher;
pub mod model;
pub mod roles;
pub mod storage;
pub mod store;

pub use adapter::{Adapter, FileAdapter, NoopAdapter};
pub use defs::{Effect, Rule};
pub use enforcer::Enforcer;
pub use errors::EngineError;
pub use expr::Value;
pub use model::Model;
pub use roles::RoleManager;
