//! Video models for candle.
//!
//! Candle only ships 1D and 2D convolutions and 2D pooling, [`layers`] adds their 3D
//! counterparts. [`models::s3d`] builds the S3D video classifier on top of them.
pub mod checkpoint;
pub mod layers;
pub mod models;
pub mod pretrained;
