// Cluster Poller - telemetry harvester for storage clusters
//
// One poller targets one cluster: collectors poll counters and inventory on
// their own schedules, the cook pipeline turns raw samples into rates and
// averages, plugins reshape the result and exporters publish it either as a
// scrape endpoint or by pushing line protocol.

pub mod collector;
pub mod config;
pub mod cook;
pub mod counters;
pub mod error;
pub mod exporter;
pub mod matrix;
pub mod plugin;
pub mod poller;
pub mod schedule;
