//! Active Directory connector
//!
//! Implements the connector traits on top of the search executor, the sync
//! engine and the mutation pipeline.

use std::sync::{Arc, OnceLock};

use dirsync_connector::config::ConnectorConfig;
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::filter::Filter;
use dirsync_connector::object::{ConnectorObject, ObjectClass, SearchSummary, SyncDelta, SyncSummary, SyncToken};
use dirsync_connector::operation::{AttributeSet, Uid, UpdateType};
use dirsync_connector::options::{OperationOptions, OP_RETURN_UID_ONLY, OP_W2K_DOMAIN};
use dirsync_connector::traits::{
    AuthenticateOp, Connector, CreateOp, DeleteOp, SearchOp, SyncOp, UpdateOp,
};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::AdConfig;
use crate::directory::{
    Connection, Credentials, Directory, Endpoint, LazyConnection, LdapDirectory, NativeErrorKind,
};
use crate::dn;
use crate::mutation::Mutator;
use crate::schema::Schema;
use crate::search::{SearchRequest, Searcher};
use crate::sync::{SyncEngine, SyncTarget};

/// Connector for one Active Directory domain.
pub struct AdConnector {
    config: AdConfig,

    display_name: String,

    directory: Arc<dyn Directory>,

    credentials: Credentials,

    /// Computed on first use from the configured account class.
    schema: OnceLock<Schema>,

    /// Bound to the default search endpoint at construction; only searches
    /// rooted at the search container use it.
    persistent: RwLock<Option<Arc<dyn Connection>>>,

    /// Sync server, either configured or discovered on the first sync.
    sync_server: RwLock<Option<String>>,
}

impl std::fmt::Debug for AdConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdConnector")
            .field("display_name", &self.display_name)
            .field("config", &self.config)
            .field("sync_server", &*self.sync_server.read())
            .finish_non_exhaustive()
    }
}

impl AdConnector {
    /// Connect to the directory over LDAP.
    pub fn new(config: AdConfig) -> ConnectorResult<Self> {
        let directory = Arc::new(LdapDirectory::new(config.use_ssl, config.connection.clone()));
        Self::with_directory(config, directory)
    }

    /// Validate `config` and bind the persistent search connection.
    pub fn with_directory(config: AdConfig, directory: Arc<dyn Directory>) -> ConnectorResult<Self> {
        config.validate()?;
        let credentials = config.credentials();
        let endpoint = config.search_endpoint();
        let persistent = directory
            .open(&endpoint, &credentials)
            .map_err(|e| e.into_connector_error("connect", &endpoint.to_string()))?;
        info!(
            endpoint = %endpoint,
            container = %config.search_container,
            config = %config.summary(),
            "Active Directory connector initialized"
        );

        Ok(Self {
            display_name: format!("Active Directory: {}", config.domain_name),
            sync_server: RwLock::new(config.sync_server().map(str::to_string)),
            config,
            directory,
            credentials,
            schema: OnceLock::new(),
            persistent: RwLock::new(Some(persistent)),
        })
    }

    /// The configuration, including a sync server discovered at runtime.
    pub fn config(&self) -> AdConfig {
        match self.sync_server.read().clone() {
            Some(server) => self.config.clone().with_sync_server(server),
            None => self.config.clone(),
        }
    }

    pub fn schema(&self) -> &Schema {
        self.schema
            .get_or_init(|| Schema::build(&self.config.object_class))
    }

    fn searcher(&self) -> Searcher<'_> {
        let searcher = Searcher::new(
            &*self.directory,
            self.schema(),
            &self.credentials,
            self.config.domain_controller(),
        );
        match self.persistent.read().as_ref() {
            Some(connection) => {
                searcher.with_persistent(Arc::clone(connection), self.config.search_container.clone())
            }
            None => searcher,
        }
    }

    fn mutator(&self) -> Mutator<'_> {
        let connection = LazyConnection::new(
            &*self.directory,
            self.config.domain_controller(),
            self.credentials.clone(),
        );
        Mutator::new(connection, self.schema(), self.config.use_ssl)
    }

    fn require_principal(&self, object_class: &ObjectClass, operation: &str) -> ConnectorResult<()> {
        if self.schema().class(object_class).is_principal {
            Ok(())
        } else {
            Err(ConnectorError::usage(format!(
                "{operation} is not supported for object class {object_class}"
            )))
        }
    }

    /// The sync server, discovering and caching one when none is configured.
    fn sync_endpoint(&self) -> ConnectorResult<Endpoint> {
        let global_catalog = self.config.search_child_domains;
        if let Some(server) = self.sync_server.read().clone() {
            return Ok(Endpoint {
                server,
                global_catalog,
            });
        }

        warn!(
            "No server was configured for synchronization, so picking one. \
             You should configure a server for best performance."
        );
        let domain = &self.config.domain_name;
        let found = if global_catalog {
            self.directory.find_global_catalog(domain, &self.credentials)
        } else {
            self.directory.find_domain_controller(domain, &self.credentials)
        }
        .map_err(|e| e.into_connector_error("sync", domain))?;

        let mut cached = self.sync_server.write();
        // Another thread may have discovered one first; keep it.
        let server = cached.get_or_insert(found).clone();
        info!(server = %server, global_catalog, "Using discovered sync server");
        Ok(Endpoint {
            server,
            global_catalog,
        })
    }

    /// The account class must exist in the schema and the search container
    /// in the tree.
    fn check_target(&self, connection: &dyn Connection) -> ConnectorResult<()> {
        let class = self.schema().class(&ObjectClass::Account).native_class;
        if !connection
            .schema_class_exists(&class)
            .map_err(|e| e.into_connector_error("test", &class))?
        {
            return Err(ConnectorError::configuration(format!(
                "object class {} does not exist in the directory schema",
                self.config.object_class
            )));
        }
        let container = &self.config.search_container;
        if !connection
            .exists(container)
            .map_err(|e| e.into_connector_error("test", container))?
        {
            return Err(ConnectorError::configuration(format!(
                "search container {container} does not exist"
            )));
        }
        Ok(())
    }

    fn ignore_run_as(options: &OperationOptions) {
        if let Some(user) = &options.run_as_user {
            debug!(run_as = %user, "runAsUser only applies to script execution; ignoring");
        }
    }
}

impl Connector for AdConnector {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    #[instrument(skip(self), fields(domain = %self.config.domain_name))]
    fn test(&self) -> ConnectorResult<()> {
        self.config.validate()?;
        let endpoint = self.config.domain_controller();
        let connection = self
            .directory
            .open(&endpoint, &self.credentials)
            .map_err(|e| e.into_connector_error("test", &endpoint.to_string()))?;

        let result = self.check_target(&*connection);
        connection.close();

        if result.is_ok() {
            info!(endpoint = %endpoint, "Connection test succeeded");
        }
        result
    }

    fn dispose(&self) -> ConnectorResult<()> {
        if let Some(connection) = self.persistent.write().take() {
            connection.close();
            debug!("Persistent search connection closed");
        }
        Ok(())
    }
}

impl CreateOp for AdConnector {
    #[instrument(skip(self, attributes, options), fields(class = %object_class))]
    fn create(
        &self,
        object_class: &ObjectClass,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        Self::ignore_run_as(options);
        let mut mutator = self.mutator();
        let result = mutator.create(object_class, &attributes);
        mutator.release();
        result
    }
}

impl UpdateOp for AdConnector {
    #[instrument(skip(self, attributes, options), fields(class = %object_class, uid = %uid))]
    fn update(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        Self::ignore_run_as(options);
        let mut mutator = self.mutator();
        let result = mutator.update(object_class, uid, update_type, &attributes);
        mutator.release();
        result
    }
}

impl DeleteOp for AdConnector {
    #[instrument(skip(self, options), fields(class = %object_class, uid = %uid))]
    fn delete(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<()> {
        Self::ignore_run_as(options);
        let mut mutator = self.mutator();
        let result = mutator.delete(object_class, uid);
        mutator.release();
        result
    }
}

impl SearchOp for AdConnector {
    #[instrument(skip(self, filter, handler, options), fields(class = %object_class))]
    fn search(
        &self,
        object_class: &ObjectClass,
        filter: Option<&Filter>,
        handler: &mut dyn FnMut(ConnectorObject) -> bool,
        options: &OperationOptions,
    ) -> ConnectorResult<SearchSummary> {
        let request = SearchRequest::from_options(
            self.schema(),
            object_class,
            filter,
            options,
            &self.config.search_container,
            self.config.search_endpoint(),
        )?;
        self.searcher().execute(request, handler)
    }
}

impl SyncOp for AdConnector {
    #[instrument(skip(self, token, handler, options), fields(class = %object_class))]
    fn sync(
        &self,
        object_class: &ObjectClass,
        token: Option<&SyncToken>,
        handler: &mut dyn FnMut(SyncDelta) -> bool,
        options: &OperationOptions,
    ) -> ConnectorResult<SyncSummary> {
        self.require_principal(object_class, "sync")?;
        let endpoint = self.sync_endpoint()?;
        let attributes = options
            .attributes_to_get
            .clone()
            .unwrap_or_else(|| self.schema().class(object_class).default_attributes);
        let target = SyncTarget {
            endpoint,
            container: self.config.search_container.clone(),
            object_class: object_class.clone(),
            attributes,
        };

        let searcher = self.searcher();
        let engine = SyncEngine::new(&*self.directory, &self.credentials, self.schema(), &searcher);
        engine.sync(&target, token, handler)
    }

    #[instrument(skip(self), fields(class = %object_class))]
    fn latest_sync_token(&self, object_class: &ObjectClass) -> ConnectorResult<SyncToken> {
        self.require_principal(object_class, "sync")?;
        let endpoint = self.sync_endpoint()?;
        let searcher = self.searcher();
        let engine = SyncEngine::new(&*self.directory, &self.credentials, self.schema(), &searcher);
        engine.latest_token(&endpoint)
    }
}

impl AuthenticateOp for AdConnector {
    #[instrument(skip(self, password, options), fields(class = %object_class))]
    fn authenticate(
        &self,
        object_class: &ObjectClass,
        username: &str,
        password: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.require_principal(object_class, "authenticate")?;
        let username = username.trim();
        if username.is_empty() {
            return Err(ConnectorError::usage("a username is required"));
        }
        // returnUidOnly is honored only when no w2k_domain is given.
        let domain = options.get_str(OP_W2K_DOMAIN);
        let uid_only = domain.is_none() && options.get_bool(OP_RETURN_UID_ONLY).unwrap_or(false);
        let principal = match domain {
            Some(domain)
                if !domain.is_empty() && !username.contains('@') && !username.contains('\\') =>
            {
                format!("{username}@{domain}")
            }
            _ => username.to_string(),
        };

        if uid_only {
            debug!(principal = %principal, "Resolving identifier without a bind");
        } else {
            let endpoint = self.config.domain_controller();
            let connection = self
                .directory
                .open(&endpoint, &Credentials::new(principal.clone(), password))
                .map_err(|e| match e.kind {
                    NativeErrorKind::InvalidCredentials => ConnectorError::AuthenticationFailed {
                        username: principal.clone(),
                    },
                    _ => e.into_connector_error("authenticate", &principal),
                })?;
            connection.close();
            debug!(principal = %principal, "Credentials accepted");
        }

        let account_name = principal
            .split_once('@')
            .map(|(user, _)| user)
            .or_else(|| principal.split_once('\\').map(|(_, user)| user))
            .unwrap_or(&principal);
        let filter = Filter::or(vec![
            Filter::eq("sAMAccountName", account_name),
            Filter::eq("userPrincipalName", principal.as_str()),
        ]);
        let options = OperationOptions::new()
            .with_attributes_to_get(Vec::<String>::new())
            .with_container(dn::domain_to_dn(&self.config.domain_name));
        let request = SearchRequest::from_options(
            self.schema(),
            object_class,
            Some(&filter),
            &options,
            &self.config.search_container,
            self.config.search_endpoint(),
        )?;

        let mut found = None;
        self.searcher().execute(request, &mut |object| {
            found = Some(object.uid().clone());
            false
        })?;
        let uid = found.ok_or_else(|| ConnectorError::not_found(principal.clone()))?;
        info!(principal = %principal, uid = %uid, "Authenticated");
        Ok(uid)
    }
}
