/// Prometheus collectors for the bridge, rendered on `/metrics`

pub mod prometheus;
