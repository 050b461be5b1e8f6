use chrono::Utc;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use dialoguer::console::style;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

const SERVICE_PREFIX: &str = "AC";
const STARTER_BIN: &str = "starter";
const RESTARTER_BIN: &str = "restarter";
const DEFAULT_GDB: &str = "gdb";

const ENV_CONFIG_DIR: &str = "ACRUN_CONFIG_DIR";
const ENV_TEMP_CONFIG: &str = "ACRUN_TEMP_CONFIG";
const ENV_BINPATH: &str = "ACRUN_BINPATH";
const ENV_SERVERBIN: &str = "ACRUN_SERVERBIN";
const ENV_SERVER_CONFIG: &str = "ACRUN_SERVER_CONFIG";
const ENV_SESSION_MANAGER: &str = "ACRUN_SESSION_MANAGER";
const ENV_LOGS_PATH: &str = "ACRUN_LOGS_PATH";
const ENV_CRASHES_PATH: &str = "ACRUN_CRASHES_PATH";
const ENV_SESSION_NAME: &str = "ACRUN_SESSION_NAME";
const ENV_SERVICE_MODE: &str = "ACRUN_SERVICE_MODE";
const ENV_GDB_ENABLED: &str = "ACRUN_GDB_ENABLED";

// Exported to the delegate on every dispatch; both branches set a value so a
// stale export from an earlier shell can never leak through.
const NONINTERACTIVE_ENV: &str = "ACRUN_NONINTERACTIVE";

#[derive(Parser, Debug)]
#[command(
    name = "acrun",
    version,
    about = "Server launch and restart supervisor"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the server once under the selected session manager.
    Start {
        serverbin: Option<String>,
        #[arg(long)]
        server_config: Option<PathBuf>,
        #[arg(long)]
        session_manager: Option<String>,
    },
    /// Launch the server under the crash-supervising delegate.
    Restart {
        serverbin: Option<String>,
        #[arg(long)]
        server_config: Option<PathBuf>,
        #[arg(long)]
        session_manager: Option<String>,
    },
}

#[derive(Debug, Error)]
enum AcrunError {
    #[error("config error: {0}")]
    Config(String),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigOverlay {
    bin_dir: Option<String>,
    server_bin: Option<String>,
    server_config: Option<String>,
    logs_dir: Option<String>,
    crashes_dir: Option<String>,
    session_manager: Option<String>,
    session_name: Option<String>,
    screen_name: Option<String>,
    service_mode: Option<bool>,
    gdb_enabled: Option<bool>,
    gdb: Option<String>,
}

impl ConfigOverlay {
    // A layer overwrites only the fields it sets; everything else falls
    // through to the values accumulated so far.
    fn merge_from(&mut self, layer: ConfigOverlay) {
        if layer.bin_dir.is_some() {
            self.bin_dir = layer.bin_dir;
        }
        if layer.server_bin.is_some() {
            self.server_bin = layer.server_bin;
        }
        if layer.server_config.is_some() {
            self.server_config = layer.server_config;
        }
        if layer.logs_dir.is_some() {
            self.logs_dir = layer.logs_dir;
        }
        if layer.crashes_dir.is_some() {
            self.crashes_dir = layer.crashes_dir;
        }
        if layer.session_manager.is_some() {
            self.session_manager = layer.session_manager;
        }
        if layer.session_name.is_some() {
            self.session_name = layer.session_name;
        }
        if layer.screen_name.is_some() {
            self.screen_name = layer.screen_name;
        }
        if layer.service_mode.is_some() {
            self.service_mode = layer.service_mode;
        }
        if layer.gdb_enabled.is_some() {
            self.gdb_enabled = layer.gdb_enabled;
        }
        if layer.gdb.is_some() {
            self.gdb = layer.gdb;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionManagerChoice {
    None,
    Auto,
    Tmux,
    Screen,
}

impl SessionManagerChoice {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "auto" => Some(Self::Auto),
            "tmux" => Some(Self::Tmux),
            "screen" => Some(Self::Screen),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::Tmux => "tmux",
            Self::Screen => "screen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedSessionManager {
    None,
    Tmux,
    Screen,
    Error,
}

impl ResolvedSessionManager {
    fn backend(&self) -> &'static dyn SessionBackend {
        match self {
            Self::Tmux => &TmuxBackend,
            Self::Screen => &ScreenBackend,
            Self::None | Self::Error => &NoSession,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tmux => "tmux",
            Self::Screen => "screen",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    SingleRun,
    RestartOnCrash,
}

impl RunMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SingleRun => "start",
            Self::RestartOnCrash => "restart",
        }
    }

    fn delegate(&self) -> &'static str {
        match self {
            Self::SingleRun => STARTER_BIN,
            Self::RestartOnCrash => RESTARTER_BIN,
        }
    }
}

#[derive(Debug, Clone)]
struct EffectiveConfig {
    bin_dir: Option<PathBuf>,
    server_bin: String,
    server_config: String,
    logs_dir: Option<String>,
    crashes_dir: Option<String>,
    session_manager: SessionManagerChoice,
    session_name: Option<String>,
    service_mode: bool,
    gdb_enabled: bool,
    gdb: String,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    temp_config: Option<PathBuf>,
    json: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = err.print();
                return;
            }
            // An unrecognized mode routes to help and is not an error.
            ErrorKind::InvalidSubcommand => {
                print_usage();
                return;
            }
            _ => {
                let _ = err.print();
                std::process::exit(1);
            }
        },
    };

    let ctx = Context {
        temp_config: cli.config.clone(),
        json: cli.json,
    };

    let result = match cli.command {
        None => {
            print_usage();
            Ok(0)
        }
        Some(Commands::Start {
            serverbin,
            server_config,
            session_manager,
        }) => handle_launch(
            &ctx,
            RunMode::SingleRun,
            serverbin,
            server_config,
            session_manager,
        ),
        Some(Commands::Restart {
            serverbin,
            server_config,
            session_manager,
        }) => handle_launch(
            &ctx,
            RunMode::RestartOnCrash,
            serverbin,
            server_config,
            session_manager,
        ),
    };

    match result {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                let _ = print_json(&payload);
            } else {
                eprintln!("{err}");
            }
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    let mut cmd = Cli::command();
    let _ = cmd.print_help();
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var(ENV_CONFIG_DIR) {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("acrun");
    base
}

fn load_layer(overlay: &mut ConfigOverlay, path: &Path) -> Result<(), AcrunError> {
    if !path.exists() {
        eprintln!(
            "{}",
            style(format!("no config at {}, skipping", path.display())).dim()
        );
        return Ok(());
    }
    let content = fs::read_to_string(path)?;
    let layer: ConfigOverlay = serde_yaml::from_str(&content)?;
    overlay.merge_from(layer);
    Ok(())
}

// Layer order: distributed defaults, user override, temp override, then the
// per-field environment overlay. The environment applies last and therefore
// outranks the user override file.
fn resolve_config(temp_override: Option<&PathBuf>) -> Result<ConfigOverlay, AcrunError> {
    let config_dir = default_config_dir();
    let mut overlay = ConfigOverlay::default();
    load_layer(&mut overlay, &config_dir.join("config.dist.yaml"))?;
    load_layer(&mut overlay, &config_dir.join("config.yaml"))?;
    let temp = temp_override
        .cloned()
        .or_else(|| env::var(ENV_TEMP_CONFIG).ok().map(PathBuf::from));
    if let Some(path) = temp {
        load_layer(&mut overlay, &path)?;
    }
    overlay.merge_from(env_overlay(&|key| env::var(key).ok()));
    Ok(overlay)
}

fn env_overlay(lookup: &dyn Fn(&str) -> Option<String>) -> ConfigOverlay {
    ConfigOverlay {
        bin_dir: lookup(ENV_BINPATH),
        server_bin: lookup(ENV_SERVERBIN),
        server_config: lookup(ENV_SERVER_CONFIG),
        logs_dir: lookup(ENV_LOGS_PATH),
        crashes_dir: lookup(ENV_CRASHES_PATH),
        session_manager: lookup(ENV_SESSION_MANAGER),
        session_name: lookup(ENV_SESSION_NAME),
        screen_name: None,
        service_mode: lookup(ENV_SERVICE_MODE).map(|raw| parse_bool_flag(&raw)),
        gdb_enabled: lookup(ENV_GDB_ENABLED).map(|raw| parse_bool_flag(&raw)),
        gdb: None,
    }
}

fn parse_bool_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn finalize_config(
    mut overlay: ConfigOverlay,
    serverbin: Option<String>,
    server_config: Option<PathBuf>,
    session_manager: Option<String>,
) -> EffectiveConfig {
    if let Some(bin) = serverbin {
        overlay.server_bin = Some(bin);
    }
    if let Some(path) = server_config {
        overlay.server_config = Some(path.to_string_lossy().to_string());
    }
    if let Some(raw) = session_manager {
        overlay.session_manager = Some(raw);
    }

    let server_bin = overlay.server_bin.unwrap_or_default();

    let session_manager_raw = overlay
        .session_manager
        .unwrap_or_else(|| "auto".to_string());
    let session_manager = match SessionManagerChoice::parse(&session_manager_raw) {
        Some(choice) => choice,
        None => {
            eprintln!(
                "{}",
                style(format!(
                    "unrecognized session manager '{}', running without one",
                    session_manager_raw.trim()
                ))
                .dim()
            );
            SessionManagerChoice::None
        }
    };

    let server_config = overlay.server_config.unwrap_or_else(|| {
        if server_bin.trim().is_empty() {
            String::new()
        } else {
            let (_, name) = split_binary_path(&server_bin);
            format!("{name}.conf")
        }
    });

    EffectiveConfig {
        bin_dir: overlay
            .bin_dir
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| PathBuf::from(expand_path(&raw))),
        server_bin,
        server_config,
        logs_dir: overlay.logs_dir,
        crashes_dir: overlay.crashes_dir,
        session_manager,
        // Legacy alias, resolved once here and never re-checked.
        session_name: overlay.session_name.or(overlay.screen_name),
        service_mode: overlay.service_mode.unwrap_or(false),
        gdb_enabled: overlay.gdb_enabled.unwrap_or(false),
        gdb: overlay.gdb.unwrap_or_else(|| DEFAULT_GDB.to_string()),
    }
}

fn select_session_manager(
    requested: SessionManagerChoice,
    installed: &dyn Fn(&str) -> bool,
) -> ResolvedSessionManager {
    match requested {
        SessionManagerChoice::None => ResolvedSessionManager::None,
        SessionManagerChoice::Auto => {
            if installed("tmux") {
                ResolvedSessionManager::Tmux
            } else if installed("screen") {
                ResolvedSessionManager::Screen
            } else {
                ResolvedSessionManager::None
            }
        }
        SessionManagerChoice::Tmux => {
            if installed("tmux") {
                ResolvedSessionManager::Tmux
            } else {
                ResolvedSessionManager::Error
            }
        }
        SessionManagerChoice::Screen => {
            if installed("screen") {
                ResolvedSessionManager::Screen
            } else {
                ResolvedSessionManager::Error
            }
        }
    }
}

trait SessionBackend {
    fn create_detached(
        &self,
        session: &str,
        program: &str,
        args: &[String],
        envs: &BTreeMap<String, String>,
    ) -> Result<(), AcrunError>;
    fn session_exists(&self, session: &str) -> bool;
    fn kill_session(&self, session: &str) -> Result<(), AcrunError>;
}

struct TmuxBackend;
struct ScreenBackend;
struct NoSession;

impl SessionBackend for TmuxBackend {
    fn create_detached(
        &self,
        session: &str,
        program: &str,
        args: &[String],
        envs: &BTreeMap<String, String>,
    ) -> Result<(), AcrunError> {
        let mut cmd = Command::new("tmux");
        cmd.arg("new-session")
            .arg("-d")
            .arg("-s")
            .arg(session)
            .arg("--")
            .arg(program)
            .args(args);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        let status = cmd
            .status()
            .map_err(|err| AcrunError::Process(format!("failed to run tmux: {err}")))?;
        if !status.success() {
            return Err(AcrunError::Process(format!(
                "tmux could not create session {session} (status {status})"
            )));
        }
        Ok(())
    }

    fn session_exists(&self, session: &str) -> bool {
        // "=" pins an exact session name; a bare -t matches prefixes.
        Command::new("tmux")
            .arg("has-session")
            .arg("-t")
            .arg(format!("={session}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn kill_session(&self, session: &str) -> Result<(), AcrunError> {
        let status = Command::new("tmux")
            .arg("kill-session")
            .arg("-t")
            .arg(format!("={session}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| AcrunError::Process(format!("failed to run tmux: {err}")))?;
        if !status.success() {
            return Err(AcrunError::Process(format!(
                "tmux could not kill session {session}"
            )));
        }
        Ok(())
    }
}

impl SessionBackend for ScreenBackend {
    fn create_detached(
        &self,
        session: &str,
        program: &str,
        args: &[String],
        envs: &BTreeMap<String, String>,
    ) -> Result<(), AcrunError> {
        let mut cmd = Command::new("screen");
        cmd.arg("-dmS").arg(session).arg(program).args(args);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        let status = cmd
            .status()
            .map_err(|err| AcrunError::Process(format!("failed to run screen: {err}")))?;
        if !status.success() {
            return Err(AcrunError::Process(format!(
                "screen could not create session {session} (status {status})"
            )));
        }
        Ok(())
    }

    fn session_exists(&self, session: &str) -> bool {
        // screen -ls exits non-zero when no sessions exist; scan stdout
        // regardless.
        match Command::new("screen").arg("-ls").output() {
            Ok(output) => {
                screen_sessions_contain(&String::from_utf8_lossy(&output.stdout), session)
            }
            Err(_) => false,
        }
    }

    fn kill_session(&self, session: &str) -> Result<(), AcrunError> {
        let status = Command::new("screen")
            .arg("-S")
            .arg(session)
            .arg("-X")
            .arg("quit")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| AcrunError::Process(format!("failed to run screen: {err}")))?;
        if !status.success() {
            return Err(AcrunError::Process(format!(
                "screen could not kill session {session}"
            )));
        }
        Ok(())
    }
}

impl SessionBackend for NoSession {
    fn create_detached(
        &self,
        _session: &str,
        _program: &str,
        _args: &[String],
        _envs: &BTreeMap<String, String>,
    ) -> Result<(), AcrunError> {
        Err(AcrunError::Process(
            "no session manager active".to_string(),
        ))
    }

    fn session_exists(&self, _session: &str) -> bool {
        false
    }

    fn kill_session(&self, _session: &str) -> Result<(), AcrunError> {
        Ok(())
    }
}

// Lines look like "\t12345.AC-world\t(Detached)"; the session name is the
// token after the pid dot.
fn screen_sessions_contain(listing: &str, session: &str) -> bool {
    listing.lines().any(|line| {
        line.trim()
            .split_whitespace()
            .next()
            .and_then(|token| token.split_once('.'))
            .map(|(_, name)| name == session)
            .unwrap_or(false)
    })
}

trait ProcessProbe {
    fn matches(&self, pattern: &str) -> bool;
}

struct PgrepProbe;

impl ProcessProbe for PgrepProbe {
    fn matches(&self, pattern: &str) -> bool {
        Command::new("pgrep")
            .arg("-f")
            .arg(pattern)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

// Re-evaluated on every invocation; nothing is cached. The checks
// short-circuit in order: a batch-mode debugger wrapper counts as running
// even when the bare-binary check would not match.
fn is_running(
    probe: &dyn ProcessProbe,
    backend: &dyn SessionBackend,
    cfg: &EffectiveConfig,
) -> bool {
    if !cfg.server_bin.trim().is_empty() {
        if cfg.gdb_enabled && probe.matches(&format!("gdb.*--batch.*{}", cfg.server_bin)) {
            return true;
        }
        if probe.matches(&format!("{} -c {}", cfg.server_bin, cfg.server_config)) {
            return true;
        }
    }
    if let Some(session) = &cfg.session_name {
        if backend.session_exists(session) {
            return true;
        }
    }
    false
}

fn handle_launch(
    ctx: &Context,
    mode: RunMode,
    serverbin: Option<String>,
    server_config: Option<PathBuf>,
    session_manager: Option<String>,
) -> Result<i32, AcrunError> {
    let overlay = resolve_config(ctx.temp_config.as_ref())?;
    let cfg = finalize_config(overlay, serverbin, server_config, session_manager);
    let resolved = select_session_manager(cfg.session_manager, &|name| which::which(name).is_ok());

    if is_running(&PgrepProbe, resolved.backend(), &cfg) {
        report(
            ctx,
            &format!(
                "{} {} appears to be already running",
                style("Skipped").yellow().bold(),
                cfg.server_bin
            ),
            json!({
                "action": mode.as_str(),
                "server_bin": cfg.server_bin,
                "already_running": true,
            }),
        )?;
        return Ok(0);
    }

    launch(ctx, &cfg, mode, resolved)
}

fn split_binary_path(raw: &str) -> (Option<PathBuf>, String) {
    if !raw.contains('/') {
        return (None, raw.to_string());
    }
    let path = Path::new(raw);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);
    (dir, name)
}

fn default_session_name(server_bin: &str) -> String {
    let stem = server_bin
        .strip_suffix("server")
        .filter(|s| !s.is_empty())
        .unwrap_or(server_bin);
    format!("{SERVICE_PREFIX}-{stem}")
}

fn default_runtime_dir(bin_dir: Option<&Path>, leaf: &str) -> PathBuf {
    match bin_dir {
        Some(dir) => dir.join(leaf),
        None => PathBuf::from(".").join(leaf),
    }
}

fn resolve_delegate(bin_dir: Option<&Path>, name: &str) -> String {
    if let Some(dir) = bin_dir {
        let candidate = dir.join(name);
        if candidate.exists() {
            return candidate.to_string_lossy().to_string();
        }
    }
    name.to_string()
}

// The delegate contract: exactly 8 positional arguments, in this order.
fn delegate_argv(
    bin_dir: Option<&Path>,
    server_bin: &str,
    gdb: &str,
    server_config: &str,
    stdout_log: &Path,
    stderr_log: &Path,
    gdb_enabled: bool,
    crashes_dir: &Path,
) -> Vec<String> {
    vec![
        bin_dir
            .map(|dir| dir.to_string_lossy().to_string())
            .unwrap_or_default(),
        server_bin.to_string(),
        gdb.to_string(),
        server_config.to_string(),
        stdout_log.to_string_lossy().to_string(),
        stderr_log.to_string_lossy().to_string(),
        if gdb_enabled { "1" } else { "0" }.to_string(),
        crashes_dir.to_string_lossy().to_string(),
    ]
}

fn interactive_disabled(service_mode: bool, resolved: ResolvedSessionManager) -> bool {
    service_mode && resolved == ResolvedSessionManager::None
}

fn launch(
    ctx: &Context,
    cfg: &EffectiveConfig,
    mode: RunMode,
    resolved: ResolvedSessionManager,
) -> Result<i32, AcrunError> {
    if cfg.server_bin.trim().is_empty() {
        return Err(AcrunError::Config(format!(
            "server binary is not set; pass it as an argument (acrun start worldserver), \
             set {ENV_SERVERBIN}, or set server_bin in config.yaml"
        )));
    }

    let (split_dir, server_bin) = split_binary_path(&cfg.server_bin);
    let bin_dir = match split_dir {
        Some(dir) => Some(dir),
        None => match &cfg.bin_dir {
            Some(dir) => Some(dir.clone()),
            None => which::which(&server_bin)
                .ok()
                .and_then(|path| path.parent().map(Path::to_path_buf)),
        },
    };
    if let Some(dir) = &bin_dir {
        if !dir.exists() {
            return Err(AcrunError::Config(format!(
                "binary directory not found: {}",
                dir.display()
            )));
        }
    }

    let logs_dir = cfg
        .logs_dir
        .as_ref()
        .map(|raw| PathBuf::from(expand_path(raw)))
        .unwrap_or_else(|| default_runtime_dir(bin_dir.as_deref(), "logs"));
    let crashes_dir = cfg
        .crashes_dir
        .as_ref()
        .map(|raw| PathBuf::from(expand_path(raw)))
        .unwrap_or_else(|| default_runtime_dir(bin_dir.as_deref(), "crashes"));
    fs::create_dir_all(&logs_dir)?;
    fs::create_dir_all(&crashes_dir)?;

    let session = cfg
        .session_name
        .clone()
        .unwrap_or_else(|| default_session_name(&server_bin));

    let delegate = resolve_delegate(bin_dir.as_deref(), mode.delegate());
    let stdout_log = logs_dir.join(format!("{server_bin}.log"));
    let stderr_log = logs_dir.join(format!("{server_bin}.err"));
    let argv = delegate_argv(
        bin_dir.as_deref(),
        &server_bin,
        &cfg.gdb,
        &cfg.server_config,
        &stdout_log,
        &stderr_log,
        cfg.gdb_enabled,
        &crashes_dir,
    );

    if resolved == ResolvedSessionManager::Error {
        return Err(AcrunError::Environment(format!(
            "session manager '{}' is requested but not installed",
            cfg.session_manager.as_str()
        )));
    }

    let mut envs = BTreeMap::new();
    envs.insert(
        NONINTERACTIVE_ENV.to_string(),
        if interactive_disabled(cfg.service_mode, resolved) {
            "1"
        } else {
            "0"
        }
        .to_string(),
    );

    if resolved == ResolvedSessionManager::None {
        if !ctx.json {
            println!(
                "{} {} with {}",
                style("Running").cyan().bold(),
                server_bin,
                delegate
            );
        }
        let mut cmd = Command::new(&delegate);
        cmd.args(&argv);
        for (key, value) in &envs {
            cmd.env(key, value);
        }
        let status = cmd
            .status()
            .map_err(|err| AcrunError::Process(format!("failed to run {delegate}: {err}")))?;
        let code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        report(
            ctx,
            &format!(
                "{} {} with status {}",
                if code == 0 {
                    style("Finished").green().bold()
                } else {
                    style("Exited").yellow().bold()
                },
                server_bin,
                code
            ),
            json!({
                "action": mode.as_str(),
                "server_bin": server_bin,
                "session_manager": resolved.label(),
                "delegate": delegate,
                "exit_code": code,
                "launched_at": Utc::now().to_rfc3339(),
            }),
        )?;
        return Ok(code);
    }

    resolved
        .backend()
        .create_detached(&session, &delegate, &argv, &envs)?;
    report(
        ctx,
        &format!(
            "{} {} in {} session {}",
            style("Launched").green().bold(),
            server_bin,
            resolved.label(),
            session
        ),
        json!({
            "action": mode.as_str(),
            "server_bin": server_bin,
            "session_manager": resolved.label(),
            "session": session,
            "delegate": delegate,
            "launched_at": Utc::now().to_rfc3339(),
        }),
    )?;
    Ok(0)
}

// Best-effort teardown of an owned session. Not registered as automatic exit
// cleanup: deployments under an external process manager expect the session
// to outlive this invocation.
#[allow(dead_code)]
fn teardown_session(resolved: ResolvedSessionManager, session: &str) -> Result<(), AcrunError> {
    resolved.backend().kill_session(session)
}

fn report(ctx: &Context, human: &str, payload: serde_json::Value) -> Result<(), AcrunError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)
    } else {
        println!("{human}");
        Ok(())
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), AcrunError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
