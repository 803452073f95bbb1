use super::message_manager::DEFAULT_HISTORY_CAPACITY;
use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings shared by every relay binary
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Tried in order when the primary broker does not accept the connection
    pub fallback_hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Capacity of rumqttc's request channel
    pub request_capacity: usize,
    /// Records kept in the relay history
    pub history_capacity: usize,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            fallback_hosts: vec!["test.mosquitto.org".to_string()],
            username: None,
            password: None,
            keep_alive_secs: 30,
            request_capacity: 100,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 2000,
        }
    }
}

impl MqttConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Primary host first, then the fallbacks, without duplicates
    pub fn broker_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.host.clone()];
        for host in &self.fallback_hosts {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    /// Copy of this config pointed at another host
    pub fn with_host(&self, host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..self.clone()
        }
    }

    pub fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)))
            .set_clean_session(true);
        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Globally unique client id: `prefix` followed by a random uuid (optionally shortened)
pub fn client_id(prefix: &str, hex_len: Option<usize>) -> String {
    let id = uuid::Uuid::new_v4();
    match hex_len {
        Some(len) => {
            let hex = id.simple().to_string();
            format!("{}{}", prefix, &hex[..len.min(hex.len())])
        }
        None => format!("{}{}", prefix, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_hosts_follow_primary_once() {
        let config = MqttConfig {
            host: "a".into(),
            fallback_hosts: vec!["b".into(), "a".into(), "c".into()],
            ..MqttConfig::default()
        };
        assert_eq!(config.broker_hosts(), vec!["a", "b", "c"]);
        assert_eq!(config.with_host("c").host, "c");
    }

    #[test]
    fn client_ids_are_prefixed_and_unique() {
        let a = client_id("exchange-rates-app-", Some(8));
        let b = client_id("exchange-rates-app-", Some(8));
        assert_eq!(a.len(), "exchange-rates-app-".len() + 8);
        assert_ne!(a, b);
        assert!(client_id("system_agent_", None).starts_with("system_agent_"));
    }

    #[test]
    fn options_carry_host_and_port() {
        let options = MqttConfig::default().options("id");
        assert_eq!(options.broker_address(), ("broker.hivemq.com".to_string(), 1883));
        assert_eq!(options.client_id(), "id");
    }
}
