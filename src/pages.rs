//! HTML rendering for the holding page, the error page and the status
//! dashboard. Inline templates with placeholder substitution; the holding
//! page polls `/_health` and `/_logs`, the dashboard polls `/_status/api`.

/// Data for the holding page shown while a container wakes up.
pub struct LoadingPage<'a> {
    pub container_name: &'a str,
    pub request_id: &'a str,
    pub request_path: &'a str,
    pub redirect_path: &'a str,
    pub start_timeout: &'a str,
}

/// Data for the error page.
pub struct ErrorPage<'a> {
    pub container_name: &'a str,
    pub error: &'a str,
    pub request_id: &'a str,
    pub request_path: &'a str,
}

pub fn render_loading(page: &LoadingPage<'_>) -> String {
    LOADING_HTML
        .replace("{{container_name}}", &escape_html(page.container_name))
        .replace("{{request_id}}", &escape_html(page.request_id))
        .replace("{{request_path}}", &escape_html(page.request_path))
        .replace("{{redirect_path}}", &escape_html(page.redirect_path))
        .replace("{{start_timeout}}", &escape_html(page.start_timeout))
}

pub fn render_error(page: &ErrorPage<'_>) -> String {
    ERROR_HTML
        .replace("{{container_name}}", &escape_html(page.container_name))
        .replace("{{error}}", &escape_html(page.error))
        .replace("{{request_id}}", &escape_html(page.request_id))
        .replace("{{request_path}}", &escape_html(page.request_path))
}

pub fn render_status(version: &str) -> String {
    STATUS_HTML.replace("{{version}}", &escape_html(version))
}

/// Escapes text for safe interpolation into HTML.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const LOADING_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Waking {{container_name}}...</title>
<style>
  body { font-family: -apple-system, "Segoe UI", Roboto, sans-serif; background: #0f1419;
         color: #e6e6e6; display: flex; align-items: center; justify-content: center;
         min-height: 100vh; margin: 0; }
  .card { max-width: 560px; width: 90%; text-align: center; }
  h1 { font-size: 1.4rem; font-weight: 600; }
  .bar { height: 6px; background: #1f2933; border-radius: 3px; overflow: hidden; margin: 1.5rem 0; }
  .bar-fill { height: 100%; width: 30%; background: #3b82f6; border-radius: 3px;
              animation: slide 1.2s ease-in-out infinite; }
  @keyframes slide { 0% { margin-left: -30%; } 100% { margin-left: 100%; } }
  .error { display: none; background: #3b1219; border: 1px solid #72232d; color: #f4a8b0;
           border-radius: 6px; padding: 0.8rem 1rem; text-align: left; margin: 1rem 0; }
  .logs { background: #0a0e12; border: 1px solid #1f2933; border-radius: 6px; padding: 0.8rem;
          text-align: left; font-family: ui-monospace, monospace; font-size: 0.75rem;
          color: #8b98a5; max-height: 220px; overflow-y: auto; white-space: pre-wrap; }
  .meta { color: #566270; font-size: 0.75rem; margin-top: 1.5rem; }
  button { background: #3b82f6; color: #fff; border: 0; border-radius: 6px;
           padding: 0.5rem 1.2rem; cursor: pointer; display: none; }
</style>
</head>
<body>
<div class="card">
  <h1>Waking <strong>{{container_name}}</strong>&hellip;</h1>
  <div class="bar" id="bar"><div class="bar-fill"></div></div>
  <div class="error" id="error"></div>
  <button id="retry" onclick="window.location.reload()">Retry</button>
  <div class="logs" id="logs">waiting for logs&hellip;</div>
  <div class="meta">request {{request_id}} &middot; path {{request_path}} &middot; timeout {{start_timeout}}</div>
</div>
<script>
  var container = "{{container_name}}";
  var redirectPath = "{{redirect_path}}";
  function poll() {
    fetch("/_health?container=" + encodeURIComponent(container))
      .then(function (r) { return r.json(); })
      .then(function (data) {
        if (data.status === "running") {
          window.location.href = redirectPath;
          return;
        }
        if (data.status === "failed") {
          document.getElementById("bar").style.display = "none";
          var err = document.getElementById("error");
          err.style.display = "block";
          err.textContent = data.error || "container failed to start";
          document.getElementById("retry").style.display = "inline-block";
          return;
        }
        setTimeout(poll, 2000);
      })
      .catch(function () { setTimeout(poll, 2000); });
  }
  function pollLogs() {
    fetch("/_logs?container=" + encodeURIComponent(container))
      .then(function (r) { return r.json(); })
      .then(function (data) {
        if (data.lines && data.lines.length) {
          var el = document.getElementById("logs");
          el.textContent = data.lines.join("\n");
          el.scrollTop = el.scrollHeight;
        }
        setTimeout(pollLogs, 2000);
      })
      .catch(function () { setTimeout(pollLogs, 2000); });
  }
  setTimeout(poll, 1000);
  setTimeout(pollLogs, 1000);
</script>
</body>
</html>
"##;

const ERROR_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{{container_name}} unavailable</title>
<style>
  body { font-family: -apple-system, "Segoe UI", Roboto, sans-serif; background: #0f1419;
         color: #e6e6e6; display: flex; align-items: center; justify-content: center;
         min-height: 100vh; margin: 0; }
  .card { max-width: 560px; width: 90%; text-align: center; }
  h1 { font-size: 1.4rem; font-weight: 600; }
  .error { background: #3b1219; border: 1px solid #72232d; color: #f4a8b0;
           border-radius: 6px; padding: 0.8rem 1rem; text-align: left; margin: 1rem 0; }
  .meta { color: #566270; font-size: 0.75rem; margin-top: 1.5rem; }
  button { background: #3b82f6; color: #fff; border: 0; border-radius: 6px;
           padding: 0.5rem 1.2rem; cursor: pointer; }
</style>
</head>
<body>
<div class="card">
  <h1><strong>{{container_name}}</strong> is unavailable</h1>
  <div class="error">{{error}}</div>
  <button onclick="window.location.reload()">Retry</button>
  <div class="meta">request {{request_id}} &middot; path {{request_path}}</div>
</div>
</body>
</html>
"##;

const STATUS_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Wakegate status</title>
<style>
  body { font-family: -apple-system, "Segoe UI", Roboto, sans-serif; background: #0f1419;
         color: #e6e6e6; margin: 0; padding: 2rem; }
  h1 { font-size: 1.3rem; }
  .grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(280px, 1fr)); gap: 1rem; }
  .grid-card { background: #151c24; border: 1px solid #1f2933; border-radius: 8px; padding: 1rem; }
  .name { font-weight: 600; }
  .host { color: #8b98a5; font-size: 0.8rem; }
  .row { display: flex; justify-content: space-between; font-size: 0.8rem;
         color: #8b98a5; margin-top: 0.3rem; }
  .dot { display: inline-block; width: 9px; height: 9px; border-radius: 50%;
         margin-right: 0.4rem; }
  .dot.running { background: #22c55e; }
  .dot.starting { background: #eab308; }
  .dot.failed { background: #ef4444; }
  .dot.unknown, .dot.exited { background: #566270; }
  button { background: #3b82f6; color: #fff; border: 0; border-radius: 6px;
           padding: 0.3rem 0.9rem; cursor: pointer; margin-top: 0.6rem; }
  .meta { color: #566270; font-size: 0.75rem; margin-top: 1.5rem; }
</style>
</head>
<body>
<h1>Wakegate</h1>
<div class="grid" id="grid"></div>
<div class="meta">wakegate {{version}} &middot; updated <span id="updated">never</span></div>
<script>
  function dotClass(c) {
    if (c.status === "running") return "running";
    if (c.start_state === "starting") return "starting";
    if (c.start_state === "failed") return "failed";
    return c.status || "unknown";
  }
  function card(c) {
    var lines = [
      ["image", c.image], ["port", c.target_port],
      ["start timeout", c.start_timeout], ["idle timeout", c.idle_timeout],
      ["last request", c.last_request || "-"]
    ];
    var rows = lines.map(function (l) {
      return '<div class="row"><span>' + l[0] + '</span><span>' + (l[1] || "-") + '</span></div>';
    }).join("");
    return '<div class="grid-card"><div class="name"><span class="dot ' + dotClass(c) +
      '"></span>' + c.name + '</div><div class="host">' + (c.host || "(group member)") +
      '</div>' + rows + '<button onclick="wake(\'' + c.name + '\')">Wake</button></div>';
  }
  function wake(name) {
    fetch("/_status/wake?container=" + encodeURIComponent(name), { method: "POST" })
      .then(function () { setTimeout(refresh, 500); });
  }
  function refresh() {
    fetch("/_status/api")
      .then(function (r) { return r.json(); })
      .then(function (data) {
        document.getElementById("grid").innerHTML = data.containers.map(card).join("");
        document.getElementById("updated").textContent = data.updated_at;
      })
      .catch(function () {});
  }
  refresh();
  setInterval(refresh, 5000);
</script>
</body>
</html>
"##;
