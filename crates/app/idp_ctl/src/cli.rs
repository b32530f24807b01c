use clap::{Args, Parser, Subcommand, ValueEnum};
use idp_core::config::{ConfigError, IdpConfig};
use idp_core::models::client::ApplicationType;

#[derive(Parser, Debug)]
#[command(name = "idp_ctl", about = "OIDC provider maintenance", version)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings shared by every database command. Anything not given here is
/// read from the environment.
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// PostgreSQL connection URL.
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Master secret that seals signing keys at rest.
    #[arg(long, global = true, env = "OIDC_CRYPTO_KEY", hide_env_values = true)]
    pub crypto_key: Option<String>,
}

impl ConnectionArgs {
    pub fn config(&self) -> Result<IdpConfig, ConfigError> {
        IdpConfig::from_lookup(|name| match name {
            "DATABASE_URL" => self.database_url.clone(),
            "OIDC_CRYPTO_KEY" => self.crypto_key.clone(),
            _ => std::env::var(name).ok(),
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Create the first signing key if none exists
    BootstrapKeys,

    /// Start signing with a new key; older keys stay published for the
    /// rotation grace period
    RotateKeys,

    /// Unpublish keys whose grace period has ended
    RetireKeys,

    /// Delete expired authorization requests, refresh tokens and denylist
    /// entries
    Sweep,

    /// Print the published JSON Web Key Set
    Jwks,

    /// Register a client and print its credentials
    RegisterClient(RegisterClientArgs),

    /// Print version
    Version,
}

#[derive(Args, Debug)]
pub struct RegisterClientArgs {
    #[arg(long)]
    pub client_id: String,

    /// Display name; defaults to the client ID.
    #[arg(long)]
    pub name: Option<String>,

    /// Allowed redirect URI (repeatable).
    #[arg(long = "redirect-uri", required = true)]
    pub redirect_uris: Vec<String>,

    #[arg(long, value_enum, default_value_t = AppType::Web)]
    pub application_type: AppType,

    /// Allowed scope (repeatable). Defaults to `openid profile email`.
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    /// Allow the refresh_token grant.
    #[arg(long)]
    pub refresh_tokens: bool,

    /// Register without a secret; the client proves itself with PKCE.
    #[arg(long)]
    pub public: bool,

    /// Do not require PKCE (confidential clients only).
    #[arg(long, conflicts_with = "public")]
    pub no_pkce: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Web,
    Native,
    UserAgent,
}

impl From<AppType> for ApplicationType {
    fn from(value: AppType) -> Self {
        match value {
            AppType::Web => ApplicationType::Web,
            AppType::Native => ApplicationType::Native,
            AppType::UserAgent => ApplicationType::UserAgent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn register_client_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "idp_ctl",
            "register-client",
            "--client-id",
            "spa",
            "--redirect-uri",
            "https://a.example/cb",
            "--redirect-uri",
            "https://b.example/cb",
            "--application-type",
            "user-agent",
            "--public",
        ])
        .unwrap();
        let Commands::RegisterClient(args) = cli.command else {
            panic!("expected register-client");
        };
        assert_eq!(args.redirect_uris.len(), 2);
        assert_eq!(args.application_type, AppType::UserAgent);
        assert!(args.public);
    }

    #[test]
    fn public_clients_cannot_skip_pkce() {
        let result = Cli::try_parse_from([
            "idp_ctl",
            "register-client",
            "--client-id",
            "spa",
            "--redirect-uri",
            "https://a.example/cb",
            "--public",
            "--no-pkce",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_override_environment_names() {
        let args = ConnectionArgs {
            database_url: Some("postgres://db.example/idp".into()),
            crypto_key: Some("k".into()),
        };
        let config = args.config().unwrap();
        assert_eq!(config.database_url, "postgres://db.example/idp");
        assert_eq!(config.crypto_key, "k");
    }
}
