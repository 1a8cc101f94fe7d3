//! `dobbin` is an in-process, single-file, transactional object database.
//! It persists a directed graph of user-defined persistent objects reachable
//! from a distinguished root, with multi-version concurrency control (MVCC)
//! across threads in one process and a cooperative commit lock across
//! processes sharing one database file.
//!
//! ## Getting started
//!
//! ```
//! use dobbin::database::{Database, DatabaseOptions};
//! use dobbin::error::DResult;
//! use dobbin::object::{Handle, PersistentClass};
//! use dobbin::value::{State, Value};
//!
//! struct Greeting {
//!     name: String,
//! }
//!
//! impl PersistentClass for Greeting {
//!     fn class_name() -> &'static str {
//!         "demo::Greeting"
//!     }
//!     fn to_state(&self) -> State {
//!         let mut state = State::new();
//!         state.insert("name".into(), Value::Str(self.name.clone()));
//!         state
//!     }
//!     fn from_state(state: &State) -> DResult<Self> {
//!         match state.get("name") {
//!             Some(Value::Str(name)) => Ok(Greeting { name: name.clone() }),
//!             _ => Err(dobbin::error::Error::TypeError("missing name".into())),
//!         }
//!     }
//! }
//!
//! fn run(path: std::path::PathBuf) -> DResult<()> {
//!     let db = Database::open(DatabaseOptions::new(path))?;
//!     let tx = db.begin();
//!     if db.get_root()?.is_none() {
//!         let handle = Handle::new(Greeting { name: "alice".into() });
//!         db.set_root(handle.entity())?;
//!     }
//!     db.commit(&tx)?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod database;
pub mod error;
pub mod log;
pub mod object;
pub mod oid;
pub mod stream;
pub mod synchronizer;
pub mod txn;
pub mod value;
