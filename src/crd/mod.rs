mod starrocks_cluster;

pub use starrocks_cluster::*;
