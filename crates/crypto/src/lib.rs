//! Cryptographic building blocks for leaf-ownership transfers: verifiable
//! secret sharing of key deltas, nested threshold Schnorr signing, adaptor
//! signatures, ECIES and wallet key derivation.

pub mod adaptor_signature;
pub mod derivation_path;
pub mod ecies;
pub mod secp;
pub mod threshold_signing;
pub mod verifiable_secret_sharing;
