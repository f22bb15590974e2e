mod quarantine;
mod topology_refresh;
pub(crate) mod utils;
