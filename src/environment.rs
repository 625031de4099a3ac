//! Environment Manager: single-flight image builder with waiter
//! notification. For a given `RuntimeEnv`, returns a ready container image,
//! deduplicating concurrent build requests within this runner and bounding
//! actual build concurrency to a small worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::driver::{Driver, ResourceLimits};
use crate::error::{DaemonError, Result};
use crate::models::RuntimeEnv;

/// One in-progress build's wait point. `result` is `None` while the build
/// runs; the builder thread sets it once (success or failure) and notifies
/// every waiter.
#[derive(Default)]
struct BuildSlot {
    result: Mutex<Option<std::result::Result<(), String>>>,
    condvar: Condvar,
}

pub struct Manager {
    driver: Arc<Driver>,
    in_progress: Arc<Mutex<HashMap<i64, Arc<BuildSlot>>>>,
    pool: crossbeam_channel::Sender<Box<dyn FnOnce() + Send>>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl Manager {
    pub fn new(driver: Arc<Driver>, pool_width: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let mut workers = Vec::with_capacity(pool_width);
        for i in 0..pool_width {
            let rx = rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("env-build-{i}"))
                    .spawn(move || {
                        for job in rx {
                            job();
                        }
                    })
                    .expect("failed to spawn environment build worker"),
            );
        }
        Self {
            driver,
            in_progress: Arc::new(Mutex::new(HashMap::new())),
            pool: tx,
            _workers: workers,
        }
    }

    /// `surveyor-env-{envId}-{hex8(sha256(dockerfile))}`. Changing the
    /// Dockerfile invalidates the cache without requiring admin action.
    pub fn image_name(env: &RuntimeEnv) -> String {
        let mut hasher = Sha256::new();
        hasher.update(env.dockerfile.as_bytes());
        let digest = hasher.finalize();
        let short = hex::encode(&digest[..4]);
        format!("surveyor-env-{}-{}", env.id, short)
    }

    /// Single-flight protocol. If we become the builder and the build fails, the
    /// error is returned directly — it does not retry. If we join an
    /// in-flight build as a waiter and wake to find the image still absent,
    /// the build failed under us; we retry from the top, possibly becoming
    /// the new builder ourselves.
    pub fn get_image(&self, env: &RuntimeEnv) -> Result<String> {
        let image = Self::image_name(env);

        loop {
            if self.driver.image_exists(&image)? {
                return Ok(image);
            }

            let (slot, is_builder) = {
                let mut in_progress = self.in_progress.lock();
                if let Some(slot) = in_progress.get(&env.id) {
                    (slot.clone(), false)
                } else {
                    let slot = Arc::new(BuildSlot::default());
                    in_progress.insert(env.id, slot.clone());
                    (slot, true)
                }
            };

            if is_builder {
                self.submit_build(env.clone(), image.clone(), slot.clone());
            }

            let mut guard = slot.result.lock();
            while guard.is_none() {
                slot.condvar.wait(&mut guard);
            }
            let result = guard.clone();
            drop(guard);

            if is_builder {
                return match result.expect("builder slot always resolves before notify") {
                    Ok(()) => {
                        if self.driver.image_exists(&image)? {
                            Ok(image)
                        } else {
                            Err(DaemonError::EnvironmentBuild(format!(
                                "build of {image} reported success but the image is missing"
                            )))
                        }
                    }
                    Err(log) => Err(DaemonError::EnvironmentBuild(log)),
                };
            }

            // Waiter: the build might have failed under us.
            if self.driver.image_exists(&image)? {
                return Ok(image);
            }
            // else: loop and retry, possibly becoming the new builder.
        }
    }

    fn submit_build(&self, env: RuntimeEnv, image: String, slot: Arc<BuildSlot>) {
        let driver = self.driver.clone();
        let in_progress = self.in_progress.clone();
        let job = move || {
            let outcome = build_container(&driver, &env, &image);
            {
                let mut map = in_progress.lock();
                map.remove(&env.id);
            }
            match &outcome {
                Ok(()) => info!(env_id = env.id, image = %image, "environment build succeeded"),
                Err(e) => warn!(env_id = env.id, error = %e, "environment build failed"),
            }
            let mut result = slot.result.lock();
            *result = Some(outcome.map_err(|e| e.to_string()));
            drop(result);
            slot.condvar.notify_all();
        };
        // The pool send can only fail if all workers have panicked and
        // dropped their receiver; treat that as unrecoverable.
        self.pool
            .send(Box::new(job))
            .expect("environment build pool workers are gone");
    }
}

fn build_container(driver: &Driver, env: &RuntimeEnv, tag: &str) -> Result<()> {
    let limits = ResourceLimits {
        cpu_limit: Some(env.cpu_limit),
        memory_limit: Some(env.memory_limit),
    };
    driver
        .build_image(&env.dockerfile, tag, &env.params, &limits, true, None)
        .map(|_log| ())
        .map_err(|e| DaemonError::EnvironmentBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_changes_with_dockerfile() {
        let mut env = sample_env("FROM alpine\n");
        let a = Manager::image_name(&env);
        env.dockerfile = "FROM alpine\nRUN true\n".into();
        let b = Manager::image_name(&env);
        assert_ne!(a, b);
        assert!(a.starts_with("surveyor-env-1-"));
    }

    #[test]
    fn test_get_image_returns_immediately_when_already_present() {
        // `true` as the engine binary makes `image exists` succeed for any
        // name, so no build is ever submitted.
        let driver = Arc::new(Driver::new("true", "cgroupfs", false));
        let manager = Manager::new(driver, 1);
        let env = sample_env("FROM alpine\n");
        let image = manager.get_image(&env).unwrap();
        assert!(image.starts_with("surveyor-env-1-"));
    }

    fn sample_env(dockerfile: &str) -> RuntimeEnv {
        RuntimeEnv {
            id: 1,
            suite_id: 1,
            dockerfile: dockerfile.to_string(),
            params: HashMap::new(),
            cpu_limit: 1,
            memory_limit: 1024,
            cpu_time_limit: 60,
            wall_clock_time_limit: 60,
        }
    }
}
