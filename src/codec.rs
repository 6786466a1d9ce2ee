pub mod framed;
pub mod keystore;
