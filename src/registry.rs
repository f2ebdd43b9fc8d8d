//! Process-wide scheme → factory registry resolving spec strings of the
//! shape `scheme://location;key=value;...` to a usable block store.
//!
//! No scheme is pre-registered; an embedding application calls [`register`]
//! for each backend it links in before calling [`open`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::{BlockCache, BlockStore};
use crate::types::EngineConfig;

/// Constructs a [`BlockStore`] for one scheme, given the spec's location
/// part, the resolved `bs`/`qs`/`cache` config, and any other `key=value`
/// options the spec carried.
pub type Factory =
    Arc<dyn Fn(&str, &EngineConfig, &HashMap<String, String>) -> Result<Arc<dyn BlockStore>> + Send + Sync>;

struct Registry {
    factories: Mutex<HashMap<String, Factory>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry { factories: Mutex::new(HashMap::new()) })
}

/// Register a factory for `scheme`. Registering the same scheme twice
/// replaces the previous factory.
pub fn register<F>(scheme: impl Into<String>, factory: F)
where
    F: Fn(&str, &EngineConfig, &HashMap<String, String>) -> Result<Arc<dyn BlockStore>> + Send + Sync + 'static,
{
    registry().factories.lock().insert(scheme.into(), Arc::new(factory));
}

/// A parsed `scheme://location;key=value;...` spec string.
#[derive(Debug, Clone)]
pub struct ParsedSpec {
    pub scheme: String,
    pub location: String,
    pub options: HashMap<String, String>,
    pub config: EngineConfig,
}

/// Parse a spec string without resolving it against the registry.
pub fn parse_spec(spec: &str) -> Result<ParsedSpec> {
    let (scheme, rest) = spec
        .split_once("://")
        .ok_or_else(|| Error::factory(format!("spec '{spec}' is missing a '://' scheme separator")))?;
    if scheme.is_empty() {
        return Err(Error::factory(format!("spec '{spec}' has an empty scheme")));
    }

    let mut parts = rest.split(';');
    let location = parts.next().unwrap_or("").to_string();

    let mut options = HashMap::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| Error::factory(format!("malformed option '{part}' in spec '{spec}'")))?;
        options.insert(k.to_string(), v.to_string());
    }

    let mut config = EngineConfig::default();
    if let Some(bs) = options.get("bs") {
        config.max_block_size = bs
            .parse()
            .map_err(|_| Error::factory(format!("invalid bs value '{bs}' in spec '{spec}'")))?;
    }
    if let Some(qs) = options.get("qs") {
        config.edit_queue_size = qs
            .parse()
            .map_err(|_| Error::factory(format!("invalid qs value '{qs}' in spec '{spec}'")))?;
    }
    if let Some(cache) = options.get("cache") {
        config.cache_bytes = cache
            .parse()
            .map_err(|_| Error::factory(format!("invalid cache value '{cache}' in spec '{spec}'")))?;
    }

    Ok(ParsedSpec { scheme: scheme.to_string(), location, options, config })
}

/// Resolve a spec string to a usable block store, wrapping it in a
/// [`BlockCache`] unless `cache=0` was given.
pub fn open(spec: &str) -> Result<Arc<dyn BlockStore>> {
    let parsed = parse_spec(spec)?;

    let factory = registry()
        .factories
        .lock()
        .get(&parsed.scheme)
        .cloned()
        .ok_or_else(|| Error::factory(format!("no block store registered for scheme '{}'", parsed.scheme)))?;

    let store = factory(&parsed.location, &parsed.config, &parsed.options)?;

    tracing::info!(scheme = %parsed.scheme, location = %parsed.location, cache_bytes = parsed.config.cache_bytes, "opened block store");

    if parsed.config.cache_bytes > 0 {
        Ok(Arc::new(BlockCache::new(store, parsed.config.cache_bytes)))
    } else {
        Ok(store)
    }
}
