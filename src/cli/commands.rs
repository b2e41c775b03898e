//! Subcommand handlers.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use secrecy::{ExposeSecret, SecretString};

use vpn_toggle::config::{self, Settings};
use vpn_toggle::constants;
use vpn_toggle::core::client::{self, ClientCommands};
use vpn_toggle::core::store::mask_secret;
use vpn_toggle::state::Endpoint;
use vpn_toggle::{
    ConnectionController, ConnectionObserver, ConnectionProfile, ConnectionState,
    ControllerOptions, CredentialStore, ErrorKind, ProcessSupervisor, VpnKind,
};

use super::args::{Args, Commands, KindArg};

/// Resolved settings plus the store they point at.
pub struct Context {
    pub settings: Settings,
    pub store: Arc<CredentialStore>,
}

impl Context {
    /// Loads settings and opens the store, honoring path overrides.
    pub fn load(args: &Args) -> Result<Self> {
        let settings_path = match &args.config {
            Some(path) => path.clone(),
            None => config::default_settings_path()?,
        };
        let mut settings = Settings::load(&settings_path)
            .wrap_err_with(|| format!("failed to load {}", settings_path.display()))?;
        if let Some(store) = &args.store {
            settings.store_path = Some(store.clone());
        }
        let store_path = settings.resolved_store_path()?;
        log::debug!("settings: {}, store: {}", settings_path.display(), store_path.display());

        let store = Arc::new(CredentialStore::new(store_path, prompt_elevated_secret));
        Ok(Self { settings, store })
    }

    fn controller(&self) -> ConnectionController {
        ConnectionController::new(
            Arc::clone(&self.store),
            ProcessSupervisor::with_os_backend(),
            ClientCommands::from_settings(&self.settings),
            ControllerOptions::from(&self.settings),
        )
    }
}

fn prompt_elevated_secret() -> Option<SecretString> {
    rpassword::prompt_password(constants::PROMPT_ELEVATED_SECRET)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

fn prompt_secret(prompt: &str) -> Result<SecretString> {
    let value = rpassword::prompt_password(prompt).wrap_err("failed to read from terminal")?;
    Ok(SecretString::from(value))
}

/// Dispatches a parsed command line.
pub fn run(args: &Args) -> Result<()> {
    let ctx = Context::load(args)?;
    match &args.command {
        Commands::List => list(&ctx),
        Commands::Add {
            name,
            kind,
            config_path,
            server,
            username,
        } => add(&ctx, name, *kind, config_path.clone(), server.clone(), username),
        Commands::Edit {
            name,
            rename,
            config_path,
            server,
            username,
            password,
            shared_secret,
        } => {
            let changes = EditRequest {
                rename: rename.clone(),
                config_path: config_path.clone(),
                server: server.clone(),
                username: username.clone(),
                password: password.then(|| prompt_secret(constants::PROMPT_VPN_PASSWORD)).transpose()?,
                shared_secret: shared_secret
                    .then(|| prompt_secret(constants::PROMPT_SHARED_SECRET))
                    .transpose()?,
            };
            edit(&ctx, name, changes)
        }
        Commands::Remove { name } => {
            ctx.store.remove_profile(name)?;
            println!("Removed '{name}'");
            Ok(())
        }
        Commands::Connect { name } => connect(&ctx, name),
        Commands::KillStray => {
            ctx.controller().kill_stray_clients()?;
            println!("Stopped all running VPN client processes");
            Ok(())
        }
        Commands::Check => check(&ctx),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let profiles = ctx.store.load_profiles()?;
    if profiles.is_empty() {
        println!("{}", constants::MSG_NO_PROFILES);
        return Ok(());
    }

    println!(
        "{:<16} {:<8} {:<32} {:<12} {:<12} REMOTE",
        "NAME", "KIND", "TARGET", "USERNAME", "PASSWORD"
    );
    for profile in &profiles {
        let remote = match &profile.endpoint {
            Endpoint::OpenVpn { config_path } => client::openvpn_remote(config_path)
                .ok()
                .flatten()
                .unwrap_or_else(|| "-".to_string()),
            Endpoint::Ipsec { server, .. } => server.clone(),
        };
        println!(
            "{:<16} {:<8} {:<32} {:<12} {:<12} {remote}",
            profile.name,
            profile.kind().to_string(),
            profile.target(),
            profile.username,
            mask_secret(profile.password.expose_secret()),
        );
    }
    Ok(())
}

fn add(
    ctx: &Context,
    name: &str,
    kind: KindArg,
    config_path: Option<PathBuf>,
    server: Option<String>,
    username: &str,
) -> Result<()> {
    let password = prompt_secret(constants::PROMPT_VPN_PASSWORD)?;
    let profile = match VpnKind::from(kind) {
        VpnKind::OpenVpn => {
            let config_path = config_path.ok_or_else(|| eyre!("--config-path is required for OpenVPN"))?;
            warn_if_no_remote(&config_path);
            ConnectionProfile::openvpn(name, config_path, username, password.expose_secret())
        }
        VpnKind::Ipsec => {
            let server = server.ok_or_else(|| eyre!("--server is required for IPsec"))?;
            let psk = prompt_secret(constants::PROMPT_SHARED_SECRET)?;
            ConnectionProfile::ipsec(
                name,
                server,
                username,
                password.expose_secret(),
                psk.expose_secret(),
            )
        }
    };
    ctx.store.add_profile(profile)?;
    println!("Added '{name}'");
    Ok(())
}

fn warn_if_no_remote(config_path: &std::path::Path) {
    match client::openvpn_remote(config_path) {
        Ok(Some(remote)) => log::debug!("{} connects to {remote}", config_path.display()),
        Ok(None) => log::warn!("no 'remote' directive in {}", config_path.display()),
        Err(e) => log::warn!("{e}"),
    }
}

struct EditRequest {
    rename: Option<String>,
    config_path: Option<PathBuf>,
    server: Option<String>,
    username: Option<String>,
    password: Option<SecretString>,
    shared_secret: Option<SecretString>,
}

fn apply_edit(mut profile: ConnectionProfile, changes: EditRequest) -> Result<ConnectionProfile> {
    if let Some(name) = changes.rename {
        profile.name = name;
    }
    if let Some(username) = changes.username {
        profile.username = username;
    }
    if let Some(password) = changes.password {
        profile.password = password;
    }
    match &mut profile.endpoint {
        Endpoint::OpenVpn { config_path } => {
            if changes.server.is_some() || changes.shared_secret.is_some() {
                bail!("--server and --shared-secret only apply to IPsec profiles");
            }
            if let Some(path) = changes.config_path {
                warn_if_no_remote(&path);
                *config_path = path;
            }
        }
        Endpoint::Ipsec {
            server,
            shared_secret,
        } => {
            if changes.config_path.is_some() {
                bail!("--config-path only applies to OpenVPN profiles");
            }
            if let Some(new_server) = changes.server {
                *server = new_server;
            }
            if let Some(secret) = changes.shared_secret {
                *shared_secret = secret;
            }
        }
    }
    Ok(profile)
}

fn edit(ctx: &Context, name: &str, changes: EditRequest) -> Result<()> {
    let profile = apply_edit(ctx.store.profile(name)?, changes)?;
    let new_name = profile.name.clone();
    ctx.store.update_profile(name, profile)?;
    println!("Updated '{new_name}'");
    Ok(())
}

enum Update {
    State(ConnectionState),
    Error(ErrorKind, String),
    Quit,
}

/// Prints progress and forwards it to the foreground loop.
struct TerminalObserver {
    updates: Sender<Update>,
}

impl ConnectionObserver for TerminalObserver {
    fn on_state_changed(&self, id: &str, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => println!("{}{id}...", constants::MSG_CONNECTING),
            ConnectionState::Authenticating => println!("Waiting for additional authentication..."),
            ConnectionState::Connected => println!("{}{id}", constants::MSG_CONNECTED),
            ConnectionState::Disconnected => println!("{}{id}", constants::MSG_DISCONNECTED),
        }
        let _ = self.updates.send(Update::State(state));
    }

    fn on_error(&self, _id: &str, kind: ErrorKind, message: &str) {
        let _ = self.updates.send(Update::Error(kind, message.to_string()));
    }
}

fn connect(ctx: &Context, name: &str) -> Result<()> {
    let controller = ctx.controller();
    let (tx, rx) = mpsc::channel();
    controller.subscribe(Arc::new(TerminalObserver {
        updates: tx.clone(),
    }));

    controller
        .connect(name)
        .wrap_err_with(|| format!("failed to connect '{name}'"))?;

    let mut connected = false;
    loop {
        match rx.recv()? {
            Update::State(ConnectionState::Connected) if !connected => {
                connected = true;
                println!("{}", constants::MSG_PRESS_ENTER);
                let quit = tx.clone();
                thread::spawn(move || {
                    let mut line = String::new();
                    let _ = io::stdin().lock().read_line(&mut line);
                    let _ = quit.send(Update::Quit);
                });
            }
            Update::State(_) => {}
            // An unexpected exit already quotes the client's last output.
            Update::Error(ErrorKind::UnexpectedExit, message) => bail!(message),
            Update::Error(kind, message) => {
                let diagnostics = controller.diagnostics(name);
                let skip = diagnostics.len().saturating_sub(constants::EXIT_OUTPUT_LINES);
                for line in &diagnostics[skip..] {
                    eprintln!("  | {line}");
                }
                bail!("{kind}: {message}");
            }
            Update::Quit => break,
        }
    }

    controller
        .disconnect(name)
        .wrap_err_with(|| format!("failed to disconnect '{name}'"))?;
    controller.flush_notifications();
    Ok(())
}

fn check(ctx: &Context) -> Result<()> {
    let commands = ClientCommands::from_settings(&ctx.settings);
    let tools = client::check_client_binaries(&commands);
    for tool in &tools {
        match (tool.found, &tool.version) {
            (true, Some(version)) => println!("  ok       {} {version}", tool.name),
            (true, None) => println!("  ok       {}", tool.name),
            (false, _) => println!("  missing  {}", tool.name),
        }
    }
    let openvpn_missing = tools
        .iter()
        .any(|t| t.name == commands.openvpn_binary && !t.found);
    if openvpn_missing {
        bail!("{} is not installed", commands.openvpn_binary);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EditRequest {
        EditRequest {
            rename: None,
            config_path: None,
            server: None,
            username: None,
            password: None,
            shared_secret: None,
        }
    }

    #[test]
    fn test_edit_openvpn_fields() {
        let profile = ConnectionProfile::openvpn("office", "/tmp/a.ovpn", "u", "p");
        let edited = apply_edit(
            profile,
            EditRequest {
                rename: Some("work".into()),
                username: Some("v".into()),
                password: Some(SecretString::from("q".to_string())),
                ..request()
            },
        )
        .unwrap();
        assert_eq!(edited.name, "work");
        assert_eq!(edited.username, "v");
        assert_eq!(edited.password.expose_secret(), "q");
        assert_eq!(edited.target(), "/tmp/a.ovpn");
    }

    #[test]
    fn test_edit_rejects_fields_of_other_kind() {
        let profile = ConnectionProfile::openvpn("office", "/tmp/a.ovpn", "u", "p");
        assert!(apply_edit(
            profile,
            EditRequest {
                server: Some("vpn.example.com".into()),
                ..request()
            }
        )
        .is_err());

        let profile = ConnectionProfile::ipsec("hq", "vpn.example.com", "u", "p", "psk");
        assert!(apply_edit(
            profile,
            EditRequest {
                config_path: Some("/tmp/a.ovpn".into()),
                ..request()
            }
        )
        .is_err());
    }

    #[test]
    fn test_edit_ipsec_server() {
        let profile = ConnectionProfile::ipsec("hq", "old.example.com", "u", "p", "psk");
        let edited = apply_edit(
            profile,
            EditRequest {
                server: Some("new.example.com".into()),
                ..request()
            },
        )
        .unwrap();
        assert_eq!(edited.target(), "new.example.com");
    }
}
