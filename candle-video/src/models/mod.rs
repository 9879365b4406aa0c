pub mod s3d;
