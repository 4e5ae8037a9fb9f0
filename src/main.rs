use std::env::args;
use std::io;
use std::str::FromStr;

use locks_n_pools::{cache, counter, deadlock, pool, queue};
use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_thread_names(true)
        .init();

    args()
        .nth(1)
        .ok_or(format!(
            "no demo supplied, use one of {} or see unit tests",
            Demo::iter()
                .map(|d| d.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| Demo::from_str(&selector).map_err(|e| e.to_string()))
        .and_then(|demo| match demo {
            Demo::Race => Ok(counter::run_race()),
            Demo::Atomic => Ok(counter::run_atomic()),
            Demo::Guarded => Ok(counter::run_guarded()),
            Demo::Keyed => Ok(counter::run_keyed()),
            Demo::Cache => Ok(cache::run()),
            Demo::Queue => Ok(queue::run()),
            Demo::Pool => pool::run_pool().map_err(|e| e.to_string()),
            Demo::Future => pool::run_future().map_err(|e| e.to_string()),
            Demo::Deadlock => Ok(deadlock::run()),
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Demo {
    Race,
    Atomic,
    Guarded,
    Keyed,
    Cache,
    Queue,
    Pool,
    Future,
    Deadlock,
}
