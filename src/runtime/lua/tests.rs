use std::path::Path;
use std::rc::Rc;

use super::*;
use crate::capability::testing::{caps, RecordingTransport};
use crate::manifest::{FsGrant, LimitOverrides, Perms};
use crate::runtime::{DispatchState, Dispatcher, Request};

fn write_app(dir: &Path, source: &str) -> PathBuf {
    let entry = dir.join("app.lua");
    std::fs::write(&entry, source).unwrap();
    entry
}

fn load(dir: &Path, source: &str, limits: HostLimits) -> LuaHost {
    let entry = write_app(dir, source);
    let mut host = LuaHost::new(limits).unwrap();
    host.load_app(&entry).unwrap();
    host
}

/// Loads the app, grants capabilities from its manifest and wraps it in
/// a dispatcher.
fn serve(dir: &Path, source: &str, limits: HostLimits) -> (Dispatcher, Rc<RecordingTransport>) {
    let mut host = load(dir, source, limits);
    let manifest = host.extract_manifest().unwrap();
    let transport = Rc::new(RecordingTransport::default());
    std::fs::create_dir_all(dir.join("data")).unwrap();
    host.grant(caps(dir, &manifest, transport.clone())).unwrap();
    (Dispatcher::new(Box::new(host)), transport)
}

fn body(res: &Response) -> &str {
    std::str::from_utf8(&res.body).unwrap()
}

// ── Routing & responses ─────────────────────────────────

#[test]
fn test_route_params_and_response_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/hello/:name", function(req, res)
          res:status(201):header("X-Greeting", "yes"):send("hi " .. req.params.name)
        end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/hello/bob")).unwrap();
    assert_eq!(res.status, Some(201));
    assert_eq!(body(&res), "hi bob");
    assert_eq!(res.headers, vec![("X-Greeting".to_string(), "yes".to_string())]);
}

#[test]
fn test_request_fields_visible() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.post("/echo", function(req, res)
          res:json({ method = req.method, q = req.query.q, h = req.headers["x-test"], body = req.body })
        end)
        "#,
        HostLimits::default(),
    );
    let req = Request::new("POST", "/echo")
        .with_query_string("q=search")
        .with_header("X-Test", "1")
        .with_body("payload");
    let res = d.dispatch(&req).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(json["method"], "POST");
    assert_eq!(json["q"], "search");
    assert_eq!(json["h"], "1");
    assert_eq!(json["body"], "payload");
    assert!(res
        .headers
        .iter()
        .any(|(k, v)| k == "content-type" && v == "application/json"));
}

#[test]
fn test_no_explicit_response() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"app.get("/", function(req, res) end)"#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    assert!(res.is_empty());
}

#[test]
fn test_route_outside_load_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/add", function(req, res)
          local ok, err = pcall(app.get, "/late", function() end)
          res:send(tostring(ok))
        end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/add")).unwrap();
    assert_eq!(body(&res), "false");
    assert!(d.dispatch(&Request::new("GET", "/late")).is_err());
}

// ── Budgets ─────────────────────────────────────────────

#[test]
fn test_infinite_loop_hits_budget_and_host_survives() {
    let dir = tempfile::tempdir().unwrap();
    let limits = HostLimits {
        instruction_budget: 1_000_000,
        ..HostLimits::default()
    };
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/spin", function(req, res) while true do end end)
        app.get("/ok", function(req, res) res:send("fine") end)
        "#,
        limits,
    );

    let err = d.dispatch(&Request::new("GET", "/spin")).unwrap_err();
    assert_eq!(
        err,
        HostError::BudgetExceeded {
            budget: "instructions"
        }
    );
    let used = d.host().instructions_used();
    assert!(used > 1_000_000);
    assert!(used <= 1_000_000 + 2 * u64::from(HOOK_INTERVAL));
    assert_eq!(d.state(), DispatchState::Idle);

    let res = d.dispatch(&Request::new("GET", "/ok")).unwrap();
    assert_eq!(body(&res), "fine");
    assert_eq!(d.stats().budget_aborts, 1);
}

#[test]
fn test_pcall_cannot_swallow_budget() {
    let dir = tempfile::tempdir().unwrap();
    let limits = HostLimits {
        instruction_budget: 200_000,
        ..HostLimits::default()
    };
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/sneaky", function(req, res)
          while true do
            pcall(function() while true do end end)
            local co = coroutine.create(function() while true do end end)
            coroutine.resume(co)
          end
        end)
        "#,
        limits,
    );
    let err = d.dispatch(&Request::new("GET", "/sneaky")).unwrap_err();
    assert!(err.is_budget());
}

#[test]
fn test_deep_recursion_hits_stack_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        local function deep(n) return deep(n + 1) + 1 end
        app.get("/deep", function(req, res) deep(1) end)
        "#,
        HostLimits::default(),
    );
    let err = d.dispatch(&Request::new("GET", "/deep")).unwrap_err();
    assert_eq!(err, HostError::StackExceeded);
}

#[test]
fn test_heap_limit() {
    let dir = tempfile::tempdir().unwrap();
    let limits = HostLimits {
        heap_bytes: 2 * 1024 * 1024,
        ..HostLimits::default()
    };
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/hog", function(req, res)
          local t = {}
          for i = 1, 100000000 do t[i] = tostring(i) end
        end)
        app.get("/ok", function(req, res) res:send("ok") end)
        "#,
        limits,
    );
    let err = d.dispatch(&Request::new("GET", "/hog")).unwrap_err();
    assert_eq!(err, HostError::BudgetExceeded { budget: "heap" });
    assert_eq!(body(&d.dispatch(&Request::new("GET", "/ok")).unwrap()), "ok");
}

#[test]
fn test_load_time_infinite_loop_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let entry = write_app(dir.path(), "while true do end");
    let mut host = LuaHost::new(HostLimits {
        instruction_budget: 100_000,
        ..HostLimits::default()
    })
    .unwrap();
    assert!(matches!(host.load_app(&entry), Err(HostError::Load(_))));
}

// ── Errors ──────────────────────────────────────────────

#[test]
fn test_script_error_carries_traceback() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"app.get("/boom", function(req, res) error("boom") end)"#,
        HostLimits::default(),
    );
    match d.dispatch(&Request::new("GET", "/boom")).unwrap_err() {
        HostError::Script { message, traceback } => {
            assert!(message.contains("boom"));
            assert!(traceback.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_load_failure_leaves_no_routes() {
    let dir = tempfile::tempdir().unwrap();
    let entry = write_app(
        dir.path(),
        r#"
        app.get("/half", function() end)
        app.manifest{ env = { "X" } }
        error("load failed")
        "#,
    );
    let mut host = LuaHost::new(HostLimits::default()).unwrap();
    let err = host.load_app(&entry).unwrap_err();
    assert!(matches!(err, HostError::Load(ref m) if m.contains("load failed")));
    assert!(host.routes().is_empty());
    assert!(!host.extract_manifest().unwrap().present);
}

#[test]
fn test_syntax_error_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let entry = write_app(dir.path(), "app.get(");
    let mut host = LuaHost::new(HostLimits::default()).unwrap();
    assert!(matches!(host.load_app(&entry), Err(HostError::Load(_))));
}

#[test]
fn test_missing_entry_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = LuaHost::new(HostLimits::default()).unwrap();
    assert!(matches!(
        host.load_app(&dir.path().join("nope.lua")),
        Err(HostError::Load(_))
    ));
}

// ── Sandboxed globals ───────────────────────────────────

#[test]
fn test_dynamic_code_and_os_access_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/probe", function(req, res)
          res:send(table.concat({
            type(load), type(loadfile), type(dofile), type(collectgarbage),
            type(string.dump), type(os), type(io), type(debug), type(package),
          }, ","))
        end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/probe")).unwrap();
    assert_eq!(body(&res), "nil,nil,nil,nil,nil,nil,nil,nil,nil");
}

#[test]
fn test_bytecode_modules_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("evil.lua"), b"\x1bLua\x54\x00garbage").unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.get("/", function(req, res)
          local ok = pcall(require, "evil")
          res:send(tostring(ok))
        end)
        "#,
        HostLimits::default(),
    );
    assert_eq!(body(&d.dispatch(&Request::new("GET", "/")).unwrap()), "false");
}

#[test]
fn test_require_app_module_cached() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("lib")).unwrap();
    std::fs::write(
        dir.path().join("lib/counter.lua"),
        "local M = { n = 0 } function M.bump() M.n = M.n + 1 return M.n end return M",
    )
    .unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        local a = require("lib.counter")
        local b = require("lib.counter")
        app.get("/", function(req, res)
          a.bump()
          local escaped = pcall(require, "..secret")
          res:send(tostring(b.n) .. "," .. tostring(escaped))
        end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    assert_eq!(body(&res), "1,false");
}

// ── Capabilities ────────────────────────────────────────

const MANIFEST: &str = r#"
app.manifest{
  fs = { { path = "data", perms = "rwc" } },
  env = { "CAPSULE_LUA_TEST_VAR" },
  hosts = { "127.0.0.1" },
}
"#;

#[test]
fn test_fs_traversal_denied_and_catchable() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        &format!(
            r#"{MANIFEST}
            local fs = require("fs")
            app.get("/", function(req, res)
              local ok, err = pcall(fs.read, "../../etc/passwd")
              res:send(err.kind .. "|" .. tostring(err))
            end)
            "#
        ),
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    assert!(body(&res).starts_with("Denied|Denied: "));
}

#[test]
fn test_fs_roundtrip_within_grant() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        &format!(
            r#"{MANIFEST}
            local fs = require("fs")
            app.post("/note", function(req, res)
              fs.write("data/note.txt", req.body)
              res:send(fs.read("data/note.txt"))
            end)
            "#
        ),
        HostLimits::default(),
    );
    let res = d
        .dispatch(&Request::new("POST", "/note").with_body("remember"))
        .unwrap();
    assert_eq!(body(&res), "remember");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("data/note.txt")).unwrap(),
        "remember"
    );
}

#[test]
fn test_http_to_unlisted_host_denied_without_io() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, transport) = serve(
        dir.path(),
        &format!(
            r#"{MANIFEST}
            local http = require("http")
            app.get("/", function(req, res)
              local ok, err = pcall(http.get, "http://evil.example.com/x")
              res:send(err.kind)
            end)
            "#
        ),
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    assert_eq!(body(&res), "Denied");
    assert!(transport.sent.borrow().is_empty());
}

#[test]
fn test_env_allowlist() {
    std::env::set_var("CAPSULE_LUA_TEST_VAR", "visible");
    std::env::set_var("CAPSULE_LUA_TEST_HIDDEN", "hidden");
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        &format!(
            r#"{MANIFEST}
            local env = require("env")
            app.get("/", function(req, res)
              res:send(tostring(env.get("CAPSULE_LUA_TEST_VAR")) .. "," .. tostring(env.get("CAPSULE_LUA_TEST_HIDDEN")))
            end)
            "#
        ),
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    assert_eq!(body(&res), "visible,nil");
}

#[test]
fn test_capabilities_denied_during_load() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        local fs = require("fs")
        local ok, err = pcall(fs.exists, "data")
        local kind = err.kind
        app.get("/", function(req, res) res:send(kind) end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    assert_eq!(body(&res), "Denied");
}

#[test]
fn test_sequential_inserts_leave_no_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        local db = require("db")
        app.post("/setup", function(req, res) db.exec("CREATE TABLE items (name TEXT)") end)
        app.post("/items", function(req, res)
          db.exec("INSERT INTO items (name) VALUES (?)", { req.body })
          res:send(tostring(db.last_id()))
        end)
        app.get("/count", function(req, res)
          local rows = db.query("SELECT count(*) AS n FROM items")
          res:send(tostring(rows[1].n))
        end)
        "#,
        HostLimits::default(),
    );
    d.dispatch(&Request::new("POST", "/setup")).unwrap();
    d.dispatch(&Request::new("POST", "/items").with_body("a"))
        .unwrap();
    let res = d
        .dispatch(&Request::new("POST", "/items").with_body("b'); DROP TABLE items; --"))
        .unwrap();
    assert_eq!(body(&res), "2");

    let res = d.dispatch(&Request::new("GET", "/count")).unwrap();
    assert_eq!(body(&res), "2");
    assert!(!d.host().capabilities().unwrap().db.in_transaction());
}

#[test]
fn test_failed_request_transaction_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        local db = require("db")
        app.post("/setup", function(req, res) db.exec("CREATE TABLE t (v INTEGER)") end)
        app.post("/crash", function(req, res)
          db.exec("BEGIN")
          db.exec("INSERT INTO t VALUES (1)")
          error("crashed mid-transaction")
        end)
        app.get("/count", function(req, res)
          local n = 0
          db.each("SELECT v FROM t", nil, function(row) n = n + 1 end)
          res:send(tostring(n))
        end)
        "#,
        HostLimits::default(),
    );
    d.dispatch(&Request::new("POST", "/setup")).unwrap();
    assert!(d.dispatch(&Request::new("POST", "/crash")).is_err());
    let res = d.dispatch(&Request::new("GET", "/count")).unwrap();
    assert_eq!(body(&res), "0");
    assert_eq!(d.stats().rollbacks, 1);
}

#[test]
fn test_crypto_module() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        local crypto = require("crypto")
        app.get("/", function(req, res)
          local seed, pub = crypto.keypair()
          local sig = crypto.sign(seed, "msg")
          res:json({
            sha = crypto.sha256("abc"),
            ok = crypto.verify(pub, "msg", sig),
            bad = crypto.verify(pub, "other", sig),
            b64 = crypto.base64_decode(crypto.base64_encode("round")),
          })
        end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/")).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(
        json["sha"],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(json["ok"], true);
    assert_eq!(json["bad"], false);
    assert_eq!(json["b64"], "round");
}

// ── Middleware, manifest, background jobs ───────────────

#[test]
fn test_middleware_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        app.before(function(req, res)
          if req.headers["x-block"] then
            res:status(403):send("blocked")
            return false
          end
          req.ctx.user = "alice"
        end)
        app.get("/me", function(req, res) res:send(req.ctx.user) end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("GET", "/me")).unwrap();
    assert_eq!(body(&res), "alice");
    let res = d
        .dispatch(&Request::new("GET", "/me").with_header("X-Block", "1"))
        .unwrap();
    assert_eq!(res.status, Some(403));
    assert_eq!(body(&res), "blocked");
}

#[test]
fn test_manifest_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let host = load(
        dir.path(),
        r#"
        app.manifest{
          fs = { { path = "data", perms = "rw" }, { path = "public", perms = "r" } },
          env = { "HOME" },
          hosts = { "api.example.com" },
          limits = { instruction_budget = 5000 },
        }
        "#,
        HostLimits::default(),
    );
    let manifest = host.extract_manifest().unwrap();
    assert!(manifest.present);
    assert_eq!(
        manifest.fs[0],
        FsGrant {
            path: "data".into(),
            perms: Perms::parse("rw").unwrap(),
        }
    );
    assert_eq!(manifest.fs_write().count(), 1);
    assert_eq!(manifest.env, vec!["HOME"]);
    assert_eq!(manifest.hosts, vec!["api.example.com"]);
    assert_eq!(
        manifest.limits,
        LimitOverrides {
            instruction_budget: Some(5000),
            ..Default::default()
        }
    );
}

#[test]
fn test_manifest_absent_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let host = load(dir.path(), "app.get('/', function() end)", HostLimits::default());
    assert_eq!(host.extract_manifest().unwrap(), Manifest::absent());
}

#[test]
fn test_deferred_jobs_drained() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"
        count = 0
        app.post("/work", function(req, res)
          app.defer(function(step)
            count = count + step
            coroutine.yield()
            count = count + step
          end, 5)
          res:send("queued")
        end)
        app.get("/count", function(req, res) res:send(tostring(count)) end)
        "#,
        HostLimits::default(),
    );
    let res = d.dispatch(&Request::new("POST", "/work")).unwrap();
    assert_eq!(body(&res), "queued");
    assert_eq!(d.host().pending_jobs(), 0);
    assert_eq!(body(&d.dispatch(&Request::new("GET", "/count")).unwrap()), "10");
}

#[test]
fn test_drain_bounded_by_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let limits = HostLimits {
        drain_iterations: 1,
        ..HostLimits::default()
    };
    let (mut d, _) = serve(
        dir.path(),
        r#"
        count = 0
        app.post("/work", function(req, res)
          app.defer(function()
            count = count + 1
            coroutine.yield()
            count = count + 1
          end)
        end)
        app.get("/count", function(req, res) res:send(tostring(count)) end)
        "#,
        limits,
    );
    d.dispatch(&Request::new("POST", "/work")).unwrap();
    assert_eq!(d.host().pending_jobs(), 1);
    // The second dispatch drains the remaining step after its handler runs
    assert_eq!(body(&d.dispatch(&Request::new("GET", "/count")).unwrap()), "1");
    assert_eq!(d.host().pending_jobs(), 0);
}

// ── Lifecycle ───────────────────────────────────────────

#[test]
fn test_reset_twice_equals_once() {
    let dir = tempfile::tempdir().unwrap();
    let (mut d, _) = serve(
        dir.path(),
        r#"app.post("/", function(req, res) local x = 0 for i = 1, 5000 do x = x + i end end)"#,
        HostLimits::default(),
    );
    d.dispatch(&Request::new("POST", "/").with_body("12345")).unwrap();
    assert!(d.host().instructions_used() > 0);
    assert_eq!(d.host().arena().used(), 5);

    d.reset();
    let once = (d.host().arena().used(), d.host().instructions_used());
    d.reset();
    assert_eq!(once, (0, 0));
    assert_eq!(once, (d.host().arena().used(), d.host().instructions_used()));
}

#[test]
fn test_destroy_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = load(dir.path(), "app.get('/', function() end)", HostLimits::default());
    host.destroy();
    host.destroy();
    assert!(host.is_destroyed());
    let req = Request::new("GET", "/");
    let view = RequestView {
        id: "x",
        request: &req,
        params: &[],
    };
    assert_eq!(host.invoke(HandlerId(0), &view), Err(HostError::Destroyed));
}

#[test]
fn test_second_load_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = load(dir.path(), "app.get('/', function() end)", HostLimits::default());
    let entry = dir.path().join("app.lua");
    assert!(matches!(host.load_app(&entry), Err(HostError::Load(_))));
}
