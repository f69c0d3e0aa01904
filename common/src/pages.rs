//! Wizard pages: one form per step, no external assets.

use crate::{config::Config, provisioning::WizardStep};

const STYLE: &str = "body{font-family:Arial,sans-serif;max-width:520px;margin:2rem auto;padding:0 1rem;color:#111}\
label{display:block;margin:.6rem 0 .2rem}input,select{width:100%;padding:.5rem;box-sizing:border-box}\
button{padding:.6rem 1rem;margin-top:1rem}.muted{color:#555}.err{color:#a00000}";

pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        title = escape(title),
    )
}

fn error_line(error: Option<&str>) -> String {
    error
        .map(|message| format!("<p class=\"err\">{}</p>", escape(message)))
        .unwrap_or_default()
}

pub fn welcome(board: &str, ap_name: &str) -> String {
    layout(
        "Welcome",
        &format!(
            "<h1>Welcome!</h1>\n\
             <p>Let's set up your Enviro {board} so it can start taking readings.</p>\n\
             <p class=\"muted\">You are connected to <code>{ap_name}</code>.</p>\n\
             <form method=\"get\" action=\"{next}\"><button>Get started</button></form>",
            board = escape(board),
            ap_name = escape(ap_name),
            next = WizardStep::Nickname.path(),
        ),
    )
}

pub fn nickname(draft: &Config, error: Option<&str>) -> String {
    layout(
        "Step 1: Nickname",
        &format!(
            "<h1>Step 1: Nickname</h1>\n{error}\n\
             <form method=\"post\" action=\"{action}\">\n\
             <label for=\"nickname\">Give this device a name</label>\n\
             <input id=\"nickname\" name=\"nickname\" type=\"text\" maxlength=\"32\" value=\"{nickname}\">\n\
             <button>Next</button>\n</form>",
            error = error_line(error),
            action = WizardStep::Nickname.path(),
            nickname = escape(&draft.nickname),
        ),
    )
}

pub fn wifi(draft: &Config, error: Option<&str>) -> String {
    layout(
        "Step 2: WiFi",
        &format!(
            "<h1>Step 2: WiFi</h1>\n{error}\n\
             <form method=\"post\" action=\"{action}\">\n\
             <label for=\"wifi_ssid\">Network</label>\n\
             <input id=\"wifi_ssid\" name=\"wifi_ssid\" type=\"text\" list=\"networks\" maxlength=\"32\" value=\"{ssid}\">\n\
             <datalist id=\"networks\"></datalist>\n\
             <label for=\"wifi_password\">Password</label>\n\
             <input id=\"wifi_password\" name=\"wifi_password\" type=\"password\" maxlength=\"63\">\n\
             <button>Next</button>\n</form>\n\
             <script>\n\
             fetch('/networks.json').then(r=>r.json()).then(names=>{{\
             const list=document.getElementById('networks');\
             names.sort().forEach(n=>{{const o=document.createElement('option');o.value=n;list.appendChild(o);}});\
             }}).catch(()=>{{}});\n\
             </script>",
            error = error_line(error),
            action = WizardStep::Wifi.path(),
            ssid = escape(&draft.wifi_ssid),
        ),
    )
}

pub fn done(draft: &Config) -> String {
    layout(
        "Step 5: Done",
        &format!(
            "<h1>All done!</h1>\n\
             <p><strong>{nickname}</strong> will join <code>{ssid}</code> after it restarts.</p>\n\
             <form method=\"post\" action=\"{action}\"><button>Finish and restart</button></form>",
            nickname = escape(&draft.nickname),
            ssid = escape(&draft.wifi_ssid),
            action = WizardStep::Done.path(),
        ),
    )
}

/// Sent to clients that asked for another host. The meta refresh moves the
/// captive-portal browser onto the wizard's own domain.
pub fn wrong_host(target: &str) -> String {
    format!(
        "<!DOCTYPE html><head><meta http-equiv=\"refresh\" content=\"0;URL='{}'\" /></head>",
        escape(target)
    )
}

pub fn server_error(message: &str) -> String {
    layout(
        "Error",
        &format!("<h1>Something went wrong</h1>\n<p class=\"err\">{}</p>", escape(message)),
    )
}
