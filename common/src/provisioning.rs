use std::{
    collections::BTreeSet,
    path::{Component, Path, PathBuf},
};

use log::{error, info, warn};
use serde::Deserialize;

use crate::{
    config::{Config, ConfigError, ConfigStore},
    pages,
};

pub const ROUTE_WELCOME: &str = "/provision-welcome";
pub const ROUTE_NICKNAME: &str = "/provision-step-1-nickname";
pub const ROUTE_WIFI: &str = "/provision-step-2-wifi";
pub const ROUTE_DONE: &str = "/provision-step-5-done";
pub const ROUTE_NETWORKS: &str = "/networks.json";
pub const ROUTE_WRONG_HOST: &str = "/wrong-host-redirect";

pub const DEFAULT_PORTAL_DOMAIN: &str = "pico.wireless";

const MAX_NICKNAME_CHARS: usize = 32;
const MAX_SSID_BYTES: usize = 32;
const MAX_PASSWORD_CHARS: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WizardStep {
    Welcome,
    Nickname,
    Wifi,
    Done,
}

impl WizardStep {
    pub fn path(self) -> &'static str {
        match self {
            Self::Welcome => ROUTE_WELCOME,
            Self::Nickname => ROUTE_NICKNAME,
            Self::Wifi => ROUTE_WIFI,
            Self::Done => ROUTE_DONE,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            ROUTE_WELCOME => Some(Self::Welcome),
            ROUTE_NICKNAME => Some(Self::Nickname),
            ROUTE_WIFI => Some(Self::Wifi),
            ROUTE_DONE => Some(Self::Done),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Welcome => Some(Self::Nickname),
            Self::Nickname => Some(Self::Wifi),
            Self::Wifi => Some(Self::Done),
            Self::Done => None,
        }
    }
}

/// Advertised access point name, e.g. `"Enviro Urban Setup"`. A blank model
/// gives `"Enviro Setup"`.
pub fn access_point_name(model: &str) -> String {
    let mut chars = model.trim().chars();
    match chars.next() {
        Some(first) => {
            let capitalised = first.to_uppercase().chain(chars).collect::<String>();
            format!("Enviro {capitalised} Setup")
        }
        None => "Enviro Setup".to_string(),
    }
}

/// Decodes, trims and de-duplicates scanned network names. Hidden networks
/// (empty names) are dropped.
pub fn network_names(scanned: impl IntoIterator<Item = Vec<u8>>) -> Vec<String> {
    scanned
        .into_iter()
        .map(|raw| String::from_utf8_lossy(&raw).trim().to_string())
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// One access-point session: where the user is in the wizard and the config
/// being assembled.
#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub step: WizardStep,
    pub draft: Config,
    pub board: String,
    pub ap_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct PortalRequest<'a> {
    pub method: Method,
    /// Value of the `Host` header, if any.
    pub host: Option<&'a str>,
    pub path: &'a str,
    /// Form-encoded body for POST requests.
    pub body: &'a [u8],
}

impl<'a> PortalRequest<'a> {
    pub fn get(host: Option<&'a str>, path: &'a str) -> Self {
        Self {
            method: Method::Get,
            host,
            path,
            body: &[],
        }
    }

    pub fn post(host: Option<&'a str>, path: &'a str, body: &'a [u8]) -> Self {
        Self {
            method: Method::Post,
            host,
            path,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalResponse {
    Html { status: u16, body: String },
    Redirect(String),
    /// The web layer should scan and answer with [`network_names`] as JSON.
    Networks,
    Asset(PathBuf),
    NotFound,
    MethodNotAllowed,
    /// Wizard finished and persisted; reset the board.
    Reset,
}

impl PortalResponse {
    fn ok(body: String) -> Self {
        Self::Html { status: 200, body }
    }

    fn bad_request(body: String) -> Self {
        Self::Html { status: 400, body }
    }

    fn server_error(message: &str) -> Self {
        Self::Html {
            status: 500,
            body: pages::server_error(message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NicknameForm {
    nickname: String,
}

#[derive(Debug, Deserialize)]
struct WifiForm {
    wifi_ssid: String,
    wifi_password: String,
}

/// Request routing and state for the setup wizard. The web layer feeds it
/// every request and renders the returned [`PortalResponse`].
#[derive(Debug)]
pub struct ProvisioningController {
    store: ConfigStore,
    session: ProvisioningSession,
    domain: String,
    asset_root: PathBuf,
}

impl ProvisioningController {
    /// Materialises the config template (setting aside an unreadable file) and
    /// opens a session drafting from whatever is already stored.
    pub fn start(
        store: ConfigStore,
        board: &str,
        domain: impl Into<String>,
        asset_root: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let draft = match store.load() {
            Ok(config) => config,
            Err(ConfigError::NotFound { .. }) => {
                store.ensure_template_exists()?;
                store.load()?
            }
            Err(err @ (ConfigError::Corrupt { .. } | ConfigError::Invalid(_))) => {
                let backup = store.quarantine()?;
                warn!("> unusable config ({err}); moved to {}", backup.display());
                store.ensure_template_exists()?;
                store.load()?
            }
            Err(err) => return Err(err),
        };

        let session = ProvisioningSession {
            step: WizardStep::Welcome,
            draft,
            board: board.to_string(),
            ap_name: access_point_name(board),
        };

        Ok(Self {
            store,
            session,
            domain: domain.into(),
            asset_root: asset_root.into(),
        })
    }

    pub fn session(&self) -> &ProvisioningSession {
        &self.session
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn access_point_name(&self) -> &str {
        &self.session.ap_name
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.domain)
    }

    pub fn handle(&mut self, request: &PortalRequest<'_>) -> PortalResponse {
        if request.path != ROUTE_WRONG_HOST && !self.host_matches(request.host) {
            return PortalResponse::Redirect(self.url(ROUTE_WRONG_HOST));
        }

        match (request.path, request.method) {
            (ROUTE_WRONG_HOST, Method::Get) => {
                PortalResponse::ok(pages::wrong_host(&self.url(ROUTE_WELCOME)))
            }
            ("/", Method::Get) => PortalResponse::Redirect(self.url(ROUTE_WELCOME)),
            (ROUTE_NETWORKS, Method::Get) => PortalResponse::Networks,
            (ROUTE_NICKNAME, Method::Post) => self.submit_nickname(request.body),
            (ROUTE_WIFI, Method::Post) => self.submit_wifi(request.body),
            (ROUTE_DONE, Method::Post) => self.finish(),
            (path, Method::Get) => match WizardStep::from_path(path) {
                Some(step) => self.render(step),
                None => self.static_asset(path),
            },
            (path, _) if WizardStep::from_path(path).is_some() || path == ROUTE_NETWORKS => {
                PortalResponse::MethodNotAllowed
            }
            (ROUTE_WRONG_HOST, _) => PortalResponse::MethodNotAllowed,
            _ => PortalResponse::NotFound,
        }
    }

    fn host_matches(&self, host: Option<&str>) -> bool {
        host.is_some_and(|host| host.trim().eq_ignore_ascii_case(&self.domain))
    }

    fn render(&mut self, step: WizardStep) -> PortalResponse {
        info!("> provisioning step: {step:?}");
        self.session.step = step;
        let draft = &self.session.draft;
        let body = match step {
            WizardStep::Welcome => pages::welcome(&self.session.board, &self.session.ap_name),
            WizardStep::Nickname => pages::nickname(draft, None),
            WizardStep::Wifi => pages::wifi(draft, None),
            WizardStep::Done => pages::done(draft),
        };
        PortalResponse::ok(body)
    }

    fn submit_nickname(&mut self, body: &[u8]) -> PortalResponse {
        let nickname = match serde_urlencoded::from_bytes::<NicknameForm>(body) {
            Ok(form) => form.nickname.trim().to_string(),
            Err(_) => String::new(),
        };

        if let Err(message) = validate_nickname(&nickname) {
            return PortalResponse::bad_request(pages::nickname(&self.session.draft, Some(message)));
        }

        let mut draft = self.session.draft.clone();
        draft.nickname = nickname;
        self.commit(draft, WizardStep::Wifi)
    }

    fn submit_wifi(&mut self, body: &[u8]) -> PortalResponse {
        let (ssid, password) = match serde_urlencoded::from_bytes::<WifiForm>(body) {
            Ok(form) => (form.wifi_ssid.trim().to_string(), form.wifi_password),
            Err(_) => (String::new(), String::new()),
        };

        if let Err(message) = validate_wifi(&ssid, &password) {
            return PortalResponse::bad_request(pages::wifi(&self.session.draft, Some(message)));
        }

        let mut draft = self.session.draft.clone();
        draft.wifi_ssid = ssid;
        draft.wifi_password = password;
        self.commit(draft, WizardStep::Done)
    }

    fn finish(&mut self) -> PortalResponse {
        if !self.session.draft.has_credentials() {
            warn!("> cannot finish provisioning without wifi credentials");
            return PortalResponse::Redirect(self.url(ROUTE_WIFI));
        }

        let mut draft = self.session.draft.clone();
        draft.provisioned = true;
        if let Err(err) = self.store.persist(&draft) {
            error!("! failed to save config: {err}");
            return PortalResponse::server_error("Could not save settings, please try again.");
        }
        self.session.draft = draft;

        info!("> provisioning complete, resetting");
        PortalResponse::Reset
    }

    fn commit(&mut self, draft: Config, next: WizardStep) -> PortalResponse {
        if let Err(err) = self.store.persist(&draft) {
            error!("! failed to save config: {err}");
            return PortalResponse::server_error("Could not save settings, please try again.");
        }
        self.session.draft = draft;
        self.session.step = next;
        PortalResponse::Redirect(self.url(next.path()))
    }

    fn static_asset(&self, path: &str) -> PortalResponse {
        let relative = Path::new(path.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe || relative.as_os_str().is_empty() {
            return PortalResponse::NotFound;
        }

        let candidate = self.asset_root.join(relative);
        if candidate.is_file() {
            PortalResponse::Asset(candidate)
        } else {
            PortalResponse::NotFound
        }
    }
}

fn validate_nickname(nickname: &str) -> Result<(), &'static str> {
    if nickname.is_empty() {
        return Err("Please enter a nickname.");
    }
    if nickname.chars().count() > MAX_NICKNAME_CHARS {
        return Err("Nickname must be 32 characters or fewer.");
    }
    Ok(())
}

fn validate_wifi(ssid: &str, password: &str) -> Result<(), &'static str> {
    if ssid.is_empty() {
        return Err("Please choose a network.");
    }
    if ssid.len() > MAX_SSID_BYTES {
        return Err("Network name is too long.");
    }
    if password.is_empty() {
        return Err("Please enter the network password.");
    }
    if password.chars().count() > MAX_PASSWORD_CHARS {
        return Err("Password must be 63 characters or fewer.");
    }
    Ok(())
}
