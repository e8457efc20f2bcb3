//! Active Directory connector configuration

use dirsync_connector::config::{ConnectionSettings, ConnectorConfig, REDACTED};
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use serde::{Deserialize, Serialize};

use crate::directory::{Credentials, Endpoint};

/// Configuration for [`AdConnector`](crate::AdConnector).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdConfig {
    /// DNS name of the domain, e.g. `corp.example`.
    #[serde(default)]
    pub domain_name: String,

    /// Account the connector binds as.
    #[serde(default = "default_admin_name")]
    pub directory_admin_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_admin_password: Option<String>,

    /// Directory class of accounts, e.g. `User` or `inetOrgPerson`.
    #[serde(default = "default_object_class")]
    pub object_class: String,

    /// Default search root and the container of the persistent connection.
    #[serde(default)]
    pub search_container: String,

    /// Server to talk to. Defaults to the domain name, which lets DNS pick a
    /// domain controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_host_name: Option<String>,

    /// Search through the global catalog so child domains are included.
    #[serde(default)]
    pub search_child_domains: bool,

    /// Global catalog used for sync when searching child domains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_global_catalog_server: Option<String>,

    /// Domain controller used for sync otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_domain_controller: Option<String>,

    /// Use LDAPS. Required for password writes.
    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl std::fmt::Debug for AdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdConfig")
            .field("domain_name", &self.domain_name)
            .field("directory_admin_name", &self.directory_admin_name)
            .field(
                "directory_admin_password",
                &self.directory_admin_password.as_ref().map(|_| REDACTED),
            )
            .field("object_class", &self.object_class)
            .field("search_container", &self.search_container)
            .field("ldap_host_name", &self.ldap_host_name)
            .field("search_child_domains", &self.search_child_domains)
            .field("sync_global_catalog_server", &self.sync_global_catalog_server)
            .field("sync_domain_controller", &self.sync_domain_controller)
            .field("use_ssl", &self.use_ssl)
            .field("connection", &self.connection)
            .finish()
    }
}

fn default_admin_name() -> String {
    "administrator".to_string()
}

fn default_object_class() -> String {
    "User".to_string()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl AdConfig {
    pub fn new(domain_name: impl Into<String>, search_container: impl Into<String>) -> Self {
        Self {
            domain_name: domain_name.into(),
            directory_admin_name: default_admin_name(),
            directory_admin_password: None,
            object_class: default_object_class(),
            search_container: search_container.into(),
            ldap_host_name: None,
            search_child_domains: false,
            sync_global_catalog_server: None,
            sync_domain_controller: None,
            use_ssl: false,
            connection: ConnectionSettings::default(),
        }
    }

    pub fn with_admin(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.directory_admin_name = name.into();
        self.directory_admin_password = Some(password.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.ldap_host_name = Some(host.into());
        self
    }

    pub fn with_object_class(mut self, object_class: impl Into<String>) -> Self {
        self.object_class = object_class.into();
        self
    }

    #[must_use]
    pub fn with_ssl(mut self) -> Self {
        self.use_ssl = true;
        self
    }

    #[must_use]
    pub fn with_child_domains(mut self) -> Self {
        self.search_child_domains = true;
        self
    }

    /// Pin the server sync runs against.
    pub fn with_sync_server(mut self, server: impl Into<String>) -> Self {
        if self.search_child_domains {
            self.sync_global_catalog_server = Some(server.into());
        } else {
            self.sync_domain_controller = Some(server.into());
        }
        self
    }

    pub fn server(&self) -> &str {
        non_empty(&self.ldap_host_name).unwrap_or(&self.domain_name)
    }

    /// Where searches go: the global catalog when searching child domains.
    pub fn search_endpoint(&self) -> Endpoint {
        Endpoint {
            server: self.server().to_string(),
            global_catalog: self.search_child_domains,
        }
    }

    /// Where writes, binds and authoritative reads go.
    pub fn domain_controller(&self) -> Endpoint {
        Endpoint::domain_controller(self.server())
    }

    /// The pinned sync server for the current search mode, if any.
    pub fn sync_server(&self) -> Option<&str> {
        if self.search_child_domains {
            non_empty(&self.sync_global_catalog_server)
        } else {
            non_empty(&self.sync_domain_controller)
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.directory_admin_name.clone(),
            self.directory_admin_password.clone().unwrap_or_default(),
        )
    }
}

impl ConnectorConfig for AdConfig {
    fn validate(&self) -> ConnectorResult<()> {
        let mut missing = Vec::new();
        if self.domain_name.trim().is_empty() {
            missing.push("domain name");
        }
        if self.directory_admin_name.trim().is_empty() {
            missing.push("directory admin name");
        }
        if non_empty(&self.directory_admin_password).is_none() {
            missing.push("directory admin password");
        }
        if self.object_class.trim().is_empty() {
            missing.push("object class");
        }
        if self.search_container.trim().is_empty() {
            missing.push("search container");
        }
        if !missing.is_empty() {
            return Err(ConnectorError::configuration(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }
        self.connection.validate()
    }

    fn secret_fields(&self) -> Vec<&'static str> {
        match &self.directory_admin_password {
            Some(_) => vec!["directory_admin_password"],
            None => vec![],
        }
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.directory_admin_password.is_some() {
            config.directory_admin_password = Some(REDACTED.to_string());
        }
        config
    }
}
