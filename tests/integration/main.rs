#[path = "../common/mod.rs"]
mod common;

mod cancel_behaviour;
mod leader_run;
mod local_backend;
mod recovery;
mod scheduler_rules;
mod store_contract;
