//! Ceph CSI driver: controller and node services for the Container Storage Interface.

pub mod ceph;
pub mod config;
pub mod csi;
pub mod mount;
pub mod storage;
