//! Command-line arguments for the handler container and environment for the
//! module (worker) container.

use ion_common::Event;
use ion_config::AppConfig;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

pub const ACTION_PREPARE: &str = "--action=prepare";
pub const ACTION_COMMIT: &str = "--action=commit";

/// Handler arguments shared by every dispatch of this module
#[derive(Debug, Clone)]
pub struct HandlerArgs {
    shared: Vec<String>,
}

impl HandlerArgs {
    pub fn from_config(config: &AppConfig) -> Self {
        let handler = &config.handler;
        let shared = vec![
            format!("--context.name={}", config.module_name),
            "--azureblobprovider=true".to_string(),
            format!(
                "--azureblobprovider.blobaccountname={}",
                handler.blob_storage.account_name
            ),
            format!(
                "--azureblobprovider.blobaccountkey={}",
                handler.blob_storage.account_key
            ),
            format!(
                "--azureblobprovider.useproxy={}",
                handler.blob_storage.use_proxy
            ),
            "--mongodbmetaprovider=true".to_string(),
            format!(
                "--mongodbmetaprovider.collection={}",
                handler.document_storage.collection
            ),
            format!("--mongodbmetaprovider.name={}", handler.document_storage.name),
            format!(
                "--mongodbmetaprovider.password={}",
                handler.document_storage.password
            ),
            format!("--mongodbmetaprovider.port={}", handler.document_storage.port),
            "--servicebuseventprovider=true".to_string(),
            format!(
                "--servicebuseventprovider.Namespace={}",
                handler.event_provider.namespace
            ),
            format!("--servicebuseventprovider.Topic={}", config.subscribes_to_event),
            format!("--servicebuseventprovider.key={}", handler.event_provider.key),
            format!(
                "--servicebuseventprovider.authorizationrulename={}",
                handler.event_provider.key_name
            ),
            format!("--serverport={}", handler.server_port),
            format!("--loglevel={}", config.log_level),
            format!("--printconfig={}", handler.print_config),
            format!("--valideventtypes={}", config.events_published),
        ];
        Self { shared }
    }

    pub fn shared(&self) -> &[String] {
        &self.shared
    }

    /// Full argument list for one handler invocation: shared args, then the
    /// per-message args, then `action`.
    pub fn for_message(&self, event: &Event, shared_secret: &str, action: &str) -> Vec<String> {
        let context = event.context_or_default();
        debug!(correlation_id = %context.correlation_id, "Generating handler args for message");

        let mut args = self.shared.clone();
        args.extend([
            format!("--azureblobprovider.containername={}", context.correlation_id),
            format!("--sharedsecret={}", shared_secret),
            format!("--context.eventid={}", context.event_id),
            format!("--context.correlationid={}", context.correlation_id),
            format!("--context.parenteventid={}", context.parent_event_id),
            action.to_string(),
        ]);
        args
    }
}

/// Secret shared between the handler and the worker for one dispatch attempt
pub fn new_shared_secret() -> String {
    Uuid::new_v4().to_string()
}

/// Read the module environment from a dotenv file.
///
/// An empty path yields no variables. An unreadable or invalid file is logged
/// and treated as empty so a bad file does not stop dispatching.
pub fn load_module_env(path: &str) -> Vec<(String, String)> {
    if path.is_empty() {
        return Vec::new();
    }

    let iter = match dotenvy::from_path_iter(Path::new(path)) {
        Ok(iter) => iter,
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read module config, continuing without it");
            return Vec::new();
        }
    };

    match iter.collect::<Result<Vec<_>, _>>() {
        Ok(vars) => vars,
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to parse module config, continuing without it");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ion_common::Context;
    use std::io::Write;

    fn config() -> AppConfig {
        let mut config = AppConfig {
            module_name: "transcode".to_string(),
            subscribes_to_event: "file_downloaded".to_string(),
            events_published: "file_transcoded".to_string(),
            ..Default::default()
        };
        config.handler.server_port = 9000;
        config
    }

    #[test]
    fn test_shared_args() {
        let args = HandlerArgs::from_config(&config());
        let shared = args.shared();
        assert_eq!(shared[0], "--context.name=transcode");
        assert!(shared.contains(&"--serverport=9000".to_string()));
        assert!(shared.contains(&"--servicebuseventprovider.Topic=file_downloaded".to_string()));
        assert!(shared.contains(&"--valideventtypes=file_transcoded".to_string()));
    }

    #[test]
    fn test_message_args() {
        let args = HandlerArgs::from_config(&config());
        let event = Event {
            context: Some(Context {
                name: "transcode".to_string(),
                event_id: "e1".to_string(),
                correlation_id: "c1".to_string(),
                parent_event_id: "p1".to_string(),
            }),
            ..Default::default()
        };

        let full = args.for_message(&event, "s3cret", ACTION_COMMIT);
        assert_eq!(full.len(), args.shared().len() + 6);
        assert!(full.contains(&"--azureblobprovider.containername=c1".to_string()));
        assert!(full.contains(&"--sharedsecret=s3cret".to_string()));
        assert!(full.contains(&"--context.parenteventid=p1".to_string()));
        assert_eq!(full.last().map(String::as_str), Some(ACTION_COMMIT));
    }

    #[test]
    fn test_message_args_without_context() {
        let args = HandlerArgs::from_config(&config());
        let full = args.for_message(&Event::default(), "s", ACTION_PREPARE);
        assert!(full.contains(&"--context.eventid=".to_string()));
    }

    #[test]
    fn test_shared_secret_is_fresh() {
        assert_ne!(new_shared_secret(), new_shared_secret());
    }

    #[test]
    fn test_load_module_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MODEL_PATH=/models/a\n# comment\nTHRESHOLD=0.5").unwrap();

        let vars = load_module_env(file.path().to_str().unwrap());
        assert_eq!(
            vars,
            vec![
                ("MODEL_PATH".to_string(), "/models/a".to_string()),
                ("THRESHOLD".to_string(), "0.5".to_string()),
            ]
        );

        assert!(load_module_env("").is_empty());
        assert!(load_module_env("/nonexistent/module.env").is_empty());
    }
}
