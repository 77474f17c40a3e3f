//! Fabric configuration.
//!
//! Every tunable the bootstrap fabric consumes lives in one immutable
//! struct, built once at startup from `MPIRUN_*` environment variables.
//! Nothing in the fabric reads the environment after this point.

use std::env;
use std::time::Instant;

use crate::error::{FabricError, Result};

/// Process identity within a parallel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub rank: usize,
    pub nprocs: usize,
    /// Job id, used to derive the authentication text.
    pub jobid: u64,
}

/// All fabric tunables, with their environment variable names.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// MPIRUN_HOST / MPIRUN_PORT: launcher endpoint.
    pub launcher_host: Option<String>,
    pub launcher_port: u16,
    /// MPIRUN_RANK / MPIRUN_NPROCS / MPIRUN_ID.
    pub identity: Option<Identity>,

    /// MPIRUN_OPEN_TIMEOUT: total seconds allowed for wireup (< 0 = none).
    pub open_timeout_s: i64,
    /// MPIRUN_CONNECT_TRIES: connect attempts per endpoint.
    pub connect_tries: u32,
    /// MPIRUN_CONNECT_TIMEOUT: per-connect poll seconds.
    pub connect_timeout_s: u32,
    /// MPIRUN_CONNECT_BACKOFF: max seconds to sleep between attempts.
    pub connect_backoff_s: u32,
    /// MPIRUN_CONNECT_RANDOM: randomize the backoff sleep.
    pub connect_random: bool,
    /// MPIRUN_CONNECT_DOWN: parents connect to children instead of the
    /// reverse.
    pub connect_down: bool,

    /// MPIRUN_USE_TREES: enable the tree overlay.
    pub use_trees: bool,
    /// MPIRUN_PMI_ENABLE: bootstrap via an external key-value store.
    pub kvs_enable: bool,
    /// MPIRUN_SHM_ENABLE / MPIRUN_SHM_THRESHOLD: shared-memory bootstrap
    /// at or above this many ranks.
    pub shm_enable: bool,
    pub shm_threshold: usize,

    /// MPIRUN_AUTHENTICATE_ENABLE / MPIRUN_AUTHENTICATE_TIMEOUT (ms).
    pub auth_enable: bool,
    pub auth_timeout_ms: i32,

    /// MPIRUN_PORT_SCAN_TIMEOUT: total port-scan seconds (< 0 = unbounded).
    pub port_scan_timeout_s: i64,
    /// MPIRUN_PORT_SCAN_CONNECT_TIMEOUT (ms) per connect during a scan.
    pub port_scan_connect_timeout_ms: u32,
    /// MPIRUN_PORT_SCAN_CONNECT_ATTEMPTS per port.
    pub port_scan_connect_attempts: u32,
    /// MPIRUN_PORT_SCAN_CONNECT_SLEEP (ms) between ports.
    pub port_scan_connect_sleep_ms: u32,

    /// MPIRUN_SHM_PREFIX: directory for check-in and table files.
    pub shm_prefix: String,
    /// MPIRUN_SHM_PORTS: leader-tree port range expression.
    pub shm_ports: String,
    /// MPIRUN_NODEID / MPIRUN_LOCALID: node index and local rank on it.
    pub nodeid: Option<usize>,
    pub localid: Option<usize>,
    /// MPIRUN_NODELIST: nodelist expression covering all job nodes.
    pub nodelist: Option<String>,
    /// MPIRUN_TASKS_PER_NODE: e.g. `4(x3),2`.
    pub tasks_per_node: Option<String>,

    /// Time `from_env` ran; the open-timeout deadline is measured from
    /// here.
    pub started: Instant,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            launcher_host: None,
            launcher_port: 0,
            identity: None,
            open_timeout_s: -1,
            connect_tries: 7,
            connect_timeout_s: 2,
            connect_backoff_s: 5,
            connect_random: true,
            connect_down: false,
            use_trees: true,
            kvs_enable: false,
            shm_enable: true,
            shm_threshold: 1024,
            auth_enable: true,
            auth_timeout_ms: 60_000,
            port_scan_timeout_s: -1,
            port_scan_connect_timeout_ms: 500,
            port_scan_connect_attempts: 1,
            port_scan_connect_sleep_ms: 10,
            shm_prefix: "/tmp".to_string(),
            shm_ports: "4000-4100".to_string(),
            nodeid: None,
            localid: None,
            nodelist: None,
            tasks_per_node: None,
            started: Instant::now(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, into: &mut T) -> Result<()> {
    if let Ok(v) = env::var(name) {
        *into = v
            .parse()
            .map_err(|_| FabricError::Config(format!("invalid {name}='{v}'")))?;
    }
    Ok(())
}

fn env_flag(name: &str, into: &mut bool) -> Result<()> {
    let mut v: i64 = *into as i64;
    env_parse(name, &mut v)?;
    *into = v != 0;
    Ok(())
}

impl FabricConfig {
    /// Build the configuration from `MPIRUN_*` environment variables.
    ///
    /// Identity (`MPIRUN_RANK`, `MPIRUN_NPROCS`, `MPIRUN_ID`) and the
    /// launcher endpoint are optional as a group: when `MPIRUN_RANK` is
    /// present the rest of the group is required.
    pub fn from_env() -> Result<FabricConfig> {
        let mut c = FabricConfig::default();

        if env::var("MPIRUN_RANK").is_ok() {
            let mut rank = 0usize;
            env_parse("MPIRUN_RANK", &mut rank)?;
            let need = |name: &str| {
                env::var(name).map_err(|_| {
                    FabricError::Config(format!("missing required environment variable {name}"))
                })
            };
            let nprocs: usize = need("MPIRUN_NPROCS")?
                .parse()
                .map_err(|_| FabricError::Config("invalid MPIRUN_NPROCS".into()))?;
            let jobid: u64 = need("MPIRUN_ID")?
                .parse()
                .map_err(|_| FabricError::Config("invalid MPIRUN_ID".into()))?;
            c.identity = Some(Identity {
                rank,
                nprocs,
                jobid,
            });
            c.launcher_host = Some(need("MPIRUN_HOST")?);
            c.launcher_port = need("MPIRUN_PORT")?
                .parse()
                .map_err(|_| FabricError::Config("invalid MPIRUN_PORT".into()))?;
        }

        env_parse("MPIRUN_OPEN_TIMEOUT", &mut c.open_timeout_s)?;
        env_parse("MPIRUN_CONNECT_TRIES", &mut c.connect_tries)?;
        env_parse("MPIRUN_CONNECT_TIMEOUT", &mut c.connect_timeout_s)?;
        env_parse("MPIRUN_CONNECT_BACKOFF", &mut c.connect_backoff_s)?;
        env_flag("MPIRUN_CONNECT_RANDOM", &mut c.connect_random)?;
        env_flag("MPIRUN_CONNECT_DOWN", &mut c.connect_down)?;
        env_flag("MPIRUN_USE_TREES", &mut c.use_trees)?;
        env_flag("MPIRUN_PMI_ENABLE", &mut c.kvs_enable)?;
        env_flag("MPIRUN_SHM_ENABLE", &mut c.shm_enable)?;
        env_parse("MPIRUN_SHM_THRESHOLD", &mut c.shm_threshold)?;
        env_flag("MPIRUN_AUTHENTICATE_ENABLE", &mut c.auth_enable)?;
        env_parse("MPIRUN_AUTHENTICATE_TIMEOUT", &mut c.auth_timeout_ms)?;
        env_parse("MPIRUN_PORT_SCAN_TIMEOUT", &mut c.port_scan_timeout_s)?;
        env_parse(
            "MPIRUN_PORT_SCAN_CONNECT_TIMEOUT",
            &mut c.port_scan_connect_timeout_ms,
        )?;
        env_parse(
            "MPIRUN_PORT_SCAN_CONNECT_ATTEMPTS",
            &mut c.port_scan_connect_attempts,
        )?;
        env_parse(
            "MPIRUN_PORT_SCAN_CONNECT_SLEEP",
            &mut c.port_scan_connect_sleep_ms,
        )?;
        env_parse("MPIRUN_SHM_PREFIX", &mut c.shm_prefix)?;
        env_parse("MPIRUN_SHM_PORTS", &mut c.shm_ports)?;
        if env::var("MPIRUN_NODEID").is_ok() {
            let mut v = 0usize;
            env_parse("MPIRUN_NODEID", &mut v)?;
            c.nodeid = Some(v);
        }
        if env::var("MPIRUN_LOCALID").is_ok() {
            let mut v = 0usize;
            env_parse("MPIRUN_LOCALID", &mut v)?;
            c.localid = Some(v);
        }
        c.nodelist = env::var("MPIRUN_NODELIST").ok();
        c.tasks_per_node = env::var("MPIRUN_TASKS_PER_NODE").ok();
        Ok(c)
    }

    /// The wire authentication text for this job.
    pub fn auth_text(&self) -> String {
        match self.identity {
            Some(id) => format!("rgrid-{}", id.jobid),
            None => "rgrid-0".to_string(),
        }
    }

    /// True once the total wireup time limit has been exceeded.
    pub fn open_timeout_exceeded(&self) -> bool {
        self.open_timeout_s >= 0
            && self.started.elapsed().as_secs() > self.open_timeout_s as u64
    }
}
