use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "streambus-demo")]
    pub demo_topic: String,

    #[envconfig(default = "demo")]
    pub demo_route: String,

    #[envconfig(default = "streambus")]
    pub consumer_group: String,

    #[envconfig(default = "1")]
    pub consumer_instances: usize,

    /// 0 keeps order-preserving dispatch; anything higher enables the worker
    /// pool with that concurrency.
    #[envconfig(default = "0")]
    pub worker_concurrency: usize,

    /// When set, dead letters go to Postgres; otherwise to the in-memory
    /// store (lost on restart, fine for local runs).
    pub database_url: Option<String>,

    #[envconfig(default = "4")]
    pub max_pg_connections: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
