//! Service-instance registry with heartbeat-driven health checking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub weight: u32,
    pub metadata: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub health_check_failures: u32,
}

impl ServiceInstance {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatistics {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub draining_instances: usize,
    pub status_breakdown: HashMap<String, usize>,
}

type InstanceChangeCallback = Box<dyn Fn(&str, &ServiceInstance) + Send + Sync>;
type HealthFailureCallback = Box<dyn Fn(&ServiceInstance, &str) + Send + Sync>;

pub struct DistributedCoordinator {
    instances: Mutex<HashMap<String, ServiceInstance>>,
    heartbeat_interval: Duration,
    health_check_timeout: Duration,
    max_health_check_failures: u32,
    change_callbacks: Mutex<Vec<InstanceChangeCallback>>,
    failure_callbacks: Mutex<Vec<HealthFailureCallback>>,
    shutdown: Arc<AtomicBool>,
    checker_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DistributedCoordinator {
    pub fn new(
        heartbeat_interval: Duration,
        health_check_timeout: Duration,
        max_health_check_failures: u32,
    ) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            heartbeat_interval,
            health_check_timeout,
            max_health_check_failures: max_health_check_failures.max(1),
            change_callbacks: Mutex::new(Vec::new()),
            failure_callbacks: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            checker_handle: Mutex::new(None),
        }
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_change(&self, event: &str, instance: &ServiceInstance) {
        if let Ok(callbacks) = self.change_callbacks.lock() {
            for callback in callbacks.iter() {
                callback(event, instance);
            }
        }
    }

    pub fn register(
        &self,
        host: &str,
        port: u16,
        weight: u32,
        metadata: Map<String, Value>,
    ) -> ServiceInstance {
        let now = Utc::now();
        let instance = ServiceInstance {
            instance_id: format!("instance_{}", &Uuid::new_v4().simple().to_string()[..12]),
            host: host.to_string(),
            port,
            status: InstanceStatus::Healthy,
            weight,
            metadata,
            registered_at: now,
            last_heartbeat: now,
            health_check_failures: 0,
        };

        self.lock_instances()
            .insert(instance.instance_id.clone(), instance.clone());
        self.notify_change("register", &instance);
        instance
    }

    pub fn deregister(&self, instance_id: &str) -> bool {
        let removed = {
            let mut instances = self.lock_instances();
            instances.remove(instance_id).map(|mut instance| {
                instance.status = InstanceStatus::Stopped;
                instance
            })
        };
        match removed {
            Some(instance) => {
                self.notify_change("deregister", &instance);
                true
            }
            None => false,
        }
    }

    /// Refresh an instance's heartbeat; an unhealthy instance recovers.
    pub fn heartbeat(&self, instance_id: &str) -> bool {
        let recovered = {
            let mut instances = self.lock_instances();
            let Some(instance) = instances.get_mut(instance_id) else {
                return false;
            };
            instance.last_heartbeat = Utc::now();
            instance.health_check_failures = 0;
            if instance.status == InstanceStatus::Unhealthy {
                instance.status = InstanceStatus::Healthy;
                Some(instance.clone())
            } else {
                None
            }
        };
        if let Some(instance) = recovered {
            self.notify_change("recovered", &instance);
        }
        true
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.lock_instances().get(instance_id).cloned()
    }

    pub fn get_healthy_instances(&self) -> Vec<ServiceInstance> {
        self.lock_instances()
            .values()
            .filter(|instance| instance.status == InstanceStatus::Healthy)
            .cloned()
            .collect()
    }

    pub fn get_all_instances(&self) -> Vec<ServiceInstance> {
        self.lock_instances().values().cloned().collect()
    }

    pub fn set_instance_status(&self, instance_id: &str, status: InstanceStatus) -> bool {
        let changed = {
            let mut instances = self.lock_instances();
            let Some(instance) = instances.get_mut(instance_id) else {
                return false;
            };
            let old_status = instance.status;
            instance.status = status;
            if old_status != status {
                Some(instance.clone())
            } else {
                None
            }
        };
        if let Some(instance) = changed {
            self.notify_change("status_change", &instance);
        }
        true
    }

    /// Graceful shutdown: stop routing new work to the instance.
    pub fn drain_instance(&self, instance_id: &str) -> bool {
        self.set_instance_status(instance_id, InstanceStatus::Draining)
    }

    pub fn on_instance_change<F>(&self, callback: F)
    where
        F: Fn(&str, &ServiceInstance) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.change_callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn on_health_check_failure<F>(&self, callback: F)
    where
        F: Fn(&ServiceInstance, &str) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.failure_callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// One health-check sweep: every instance whose heartbeat is older than
    /// the timeout accrues a failure; at the threshold it turns UNHEALTHY.
    pub fn perform_health_check(&self) {
        let now = Utc::now();
        let mut newly_unhealthy = Vec::new();

        {
            let mut instances = self.lock_instances();
            for instance in instances.values_mut() {
                if instance.status == InstanceStatus::Stopped {
                    continue;
                }
                let elapsed = (now - instance.last_heartbeat)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed > self.health_check_timeout {
                    instance.health_check_failures += 1;
                    if instance.health_check_failures >= self.max_health_check_failures
                        && instance.status != InstanceStatus::Unhealthy
                    {
                        instance.status = InstanceStatus::Unhealthy;
                        newly_unhealthy.push(instance.clone());
                    }
                }
            }
        }

        for instance in newly_unhealthy {
            tracing::warn!(
                "Instance {} marked unhealthy after {} missed heartbeats",
                instance.instance_id,
                instance.health_check_failures
            );
            self.notify_change("unhealthy", &instance);
            if let Ok(callbacks) = self.failure_callbacks.lock() {
                for callback in callbacks.iter() {
                    callback(&instance, "timeout");
                }
            }
        }
    }

    pub fn start_health_check(self: &Arc<Self>) {
        let mut handle_guard = match self.checker_handle.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if handle_guard.is_some() {
            return;
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let coordinator = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            tracing::info!("Health checker started");
            while !shutdown.load(Ordering::Relaxed) {
                coordinator.perform_health_check();
                tokio::time::sleep(interval).await;
            }
            tracing::info!("Health checker stopped");
        });
        *handle_guard = Some(handle);
    }

    pub async fn stop_health_check(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.checker_handle.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    pub fn get_statistics(&self) -> CoordinatorStatistics {
        let instances = self.lock_instances();
        let mut status_breakdown: HashMap<String, usize> = HashMap::new();
        for instance in instances.values() {
            let key = match instance.status {
                InstanceStatus::Starting => "starting",
                InstanceStatus::Healthy => "healthy",
                InstanceStatus::Unhealthy => "unhealthy",
                InstanceStatus::Draining => "draining",
                InstanceStatus::Stopped => "stopped",
            };
            *status_breakdown.entry(key.to_string()).or_insert(0) += 1;
        }

        CoordinatorStatistics {
            total_instances: instances.len(),
            healthy_instances: status_breakdown.get("healthy").copied().unwrap_or(0),
            unhealthy_instances: status_breakdown.get("unhealthy").copied().unwrap_or(0),
            draining_instances: status_breakdown.get("draining").copied().unwrap_or(0),
            status_breakdown,
        }
    }

    pub fn get_health_endpoint(&self) -> Value {
        let stats = self.get_statistics();
        serde_json::json!({
            "status": if stats.healthy_instances > 0 { "healthy" } else { "unhealthy" },
            "instances": stats,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> DistributedCoordinator {
        DistributedCoordinator::new(
            Duration::from_millis(50),
            Duration::from_millis(100),
            3,
        )
    }

    #[test]
    fn test_register_and_heartbeat() {
        let c = coordinator();
        let instance = c.register("127.0.0.1", 9001, 100, Map::new());
        assert_eq!(instance.status, InstanceStatus::Healthy);
        assert_eq!(instance.address(), "127.0.0.1:9001");

        assert!(c.heartbeat(&instance.instance_id));
        assert!(!c.heartbeat("missing"));
        assert_eq!(c.get_healthy_instances().len(), 1);
    }

    #[test]
    fn test_deregister() {
        let c = coordinator();
        let instance = c.register("127.0.0.1", 9001, 100, Map::new());
        assert!(c.deregister(&instance.instance_id));
        assert!(!c.deregister(&instance.instance_id));
        assert!(c.get_all_instances().is_empty());
    }

    #[test]
    fn test_health_check_marks_unhealthy_after_threshold() {
        let c = coordinator();
        let instance = c.register("127.0.0.1", 9001, 100, Map::new());

        std::thread::sleep(Duration::from_millis(150));
        // Three sweeps with a stale heartbeat reach the failure threshold
        c.perform_health_check();
        c.perform_health_check();
        c.perform_health_check();

        let refreshed = c.get_instance(&instance.instance_id).unwrap();
        assert_eq!(refreshed.status, InstanceStatus::Unhealthy);
        assert!(c.get_healthy_instances().is_empty());

        // A heartbeat recovers the instance
        c.heartbeat(&instance.instance_id);
        let recovered = c.get_instance(&instance.instance_id).unwrap();
        assert_eq!(recovered.status, InstanceStatus::Healthy);
        assert_eq!(recovered.health_check_failures, 0);
    }

    #[test]
    fn test_drain_excluded_from_healthy() {
        let c = coordinator();
        let instance = c.register("127.0.0.1", 9001, 100, Map::new());
        assert!(c.drain_instance(&instance.instance_id));
        assert!(c.get_healthy_instances().is_empty());
        assert_eq!(c.get_statistics().draining_instances, 1);
    }

    #[test]
    fn test_change_callbacks_fire() {
        let c = coordinator();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        c.on_instance_change(move |event, _instance| {
            if let Ok(mut guard) = sink.lock() {
                guard.push(event.to_string());
            }
        });

        let instance = c.register("127.0.0.1", 9001, 100, Map::new());
        c.drain_instance(&instance.instance_id);
        c.deregister(&instance.instance_id);

        let seen = events.lock().unwrap();
        assert_eq!(*seen, vec!["register", "status_change", "deregister"]);
    }
}
