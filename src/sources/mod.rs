//! Concrete API catalogs built on the harvest core.

pub mod shodan;
pub mod taxii;
