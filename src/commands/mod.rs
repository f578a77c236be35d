pub mod chunk;
pub mod combine;
pub mod filter;
pub mod ledger;
pub mod status;
