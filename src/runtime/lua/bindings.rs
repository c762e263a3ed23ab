/// Capability modules as seen from Lua.
///
/// Each raw function returns `true, results...` on success or
/// `false, kind, message` on failure; a small Lua shim turns the failure
/// into an `error()` carrying `{kind = ..., message = ...}`, so scripts
/// catch capability errors with plain `pcall`.
use std::ops::ControlFlow;
use std::rc::Rc;

use base64::Engine;
use mlua::{
    Function, IntoLua, IntoLuaMulti, Lua, LuaSerdeExt, MultiValue, Table, Value as LuaValue,
};
use tracing::{debug, error, info, warn};

use super::{require_app_module, AppState};
use crate::capability::{crypto, env, fs, http, smtp, CapError, MAX_RANDOM_BYTES};
use crate::value::Value;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Names `require` resolves before looking at application modules.
pub(super) const CAPABILITY_MODULES: [&str; 7] = ["fs", "env", "http", "db", "crypto", "smtp", "log"];

const REGISTRY_MODULES: &str = "capsule.modules";

impl IntoLua for Value {
    fn into_lua(self, lua: &Lua) -> mlua::Result<LuaValue> {
        Ok(match self {
            Value::Nil => LuaValue::Nil,
            Value::Int(i) => LuaValue::Integer(i),
            Value::Double(d) => LuaValue::Number(d),
            Value::Bool(b) => LuaValue::Boolean(b),
            Value::Text(s) => LuaValue::String(lua.create_string(&s)?),
            Value::Blob(b) => LuaValue::String(lua.create_string(&b)?),
        })
    }
}

/// Converts a script value into a [`Value`]. Strings that are not valid
/// UTF-8 become blobs.
pub(super) fn value_from_lua(value: &LuaValue) -> Result<Value, CapError> {
    Ok(match value {
        LuaValue::Nil => Value::Nil,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::Int(*i),
        LuaValue::Number(n) => Value::Double(*n),
        LuaValue::String(s) => match s.to_str() {
            Ok(text) => Value::Text(text.to_string()),
            Err(_) => Value::Blob(s.as_bytes().to_vec()),
        },
        other => {
            return Err(CapError::InvalidArgument(format!(
                "cannot pass a {} as a value",
                other.type_name()
            )))
        }
    })
}

fn params_from_lua(params: Option<Table>) -> Result<Vec<Value>, CapError> {
    let Some(params) = params else {
        return Ok(Vec::new());
    };
    let len = params.raw_len();
    let mut out = Vec::with_capacity(len);
    for i in 1..=len {
        let v: LuaValue = params
            .raw_get(i)
            .map_err(|e| CapError::InvalidArgument(e.to_string()))?;
        out.push(value_from_lua(&v).map_err(|e| match e {
            CapError::InvalidArgument(m) => CapError::InvalidArgument(format!("parameter {i}: {m}")),
            other => other,
        })?);
    }
    Ok(out)
}

fn headers_from_lua(headers: Option<Table>) -> Result<Vec<(String, String)>, CapError> {
    let Some(headers) = headers else {
        return Ok(Vec::new());
    };
    headers
        .pairs::<String, String>()
        .map(|pair| pair.map_err(|e| CapError::InvalidArgument(format!("headers: {e}"))))
        .collect()
}

/// Packs a capability result for the Lua shim.
fn reply<T: IntoLuaMulti>(lua: &Lua, result: Result<T, CapError>) -> mlua::Result<MultiValue> {
    match result {
        Ok(values) => {
            let mut out = values.into_lua_multi(lua)?;
            out.push_front(LuaValue::Boolean(true));
            Ok(out)
        }
        Err(e) => (false, e.kind(), e.message().to_string()).into_lua_multi(lua),
    }
}

/// Registers a raw capability function under `name` in `table`.
fn add<A, R, F>(lua: &Lua, table: &Table, state: &Rc<AppState>, name: &str, f: F) -> mlua::Result<()>
where
    A: mlua::FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, &AppState, A) -> Result<R, CapError> + 'static,
{
    let state = Rc::clone(state);
    let func = lua.create_function(move |lua, args: A| reply(lua, f(lua, &state, args)))?;
    table.raw_set(name, func)
}

fn bytes(s: &mlua::String) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn fs_module(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    add(lua, &t, state, "read", |lua, s, path: String| {
        let data = fs::read(&s.caps()?.fs, &path)?;
        lua.create_string(&data)
            .map_err(|e| CapError::Io(e.to_string()))
    })?;
    add(lua, &t, state, "write", |_, s, (path, data): (String, mlua::String)| {
        fs::write(&s.caps()?.fs, &path, &bytes(&data))?;
        Ok(true)
    })?;
    add(lua, &t, state, "exists", |_, s, path: String| {
        fs::exists(&s.caps()?.fs, &path)
    })?;
    add(lua, &t, state, "delete", |_, s, path: String| {
        fs::delete(&s.caps()?.fs, &path)?;
        Ok(true)
    })?;
    Ok(t)
}

fn env_module(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    add(lua, &t, state, "get", |_, s, name: String| {
        Ok(env::get(&s.caps()?.env, &name))
    })?;
    Ok(t)
}

fn http_response(lua: &Lua, response: http::OutboundResponse) -> Result<Table, CapError> {
    let build = || -> mlua::Result<Table> {
        let t = lua.create_table()?;
        t.raw_set("status", response.status)?;
        let headers = lua.create_table()?;
        for (k, v) in &response.headers {
            headers.raw_set(k.as_str(), v.as_str())?;
        }
        t.raw_set("headers", headers)?;
        t.raw_set("body", lua.create_string(&response.body)?)?;
        Ok(t)
    };
    build().map_err(|e| CapError::Io(e.to_string()))
}

fn http_module(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    add(
        lua,
        &t,
        state,
        "request",
        |lua,
         s,
         (method, url, headers, body): (
            String,
            String,
            Option<Table>,
            Option<mlua::String>,
        )| {
            let caps = s.caps()?;
            let response = http::request(
                &caps.http,
                caps.transport.as_ref(),
                &method,
                &url,
                headers_from_lua(headers)?,
                body.as_ref().map(bytes).unwrap_or_default(),
            )?;
            http_response(lua, response)
        },
    )?;
    add(lua, &t, state, "get", |lua, s, (url, headers): (String, Option<Table>)| {
        let caps = s.caps()?;
        let response = http::request(
            &caps.http,
            caps.transport.as_ref(),
            "GET",
            &url,
            headers_from_lua(headers)?,
            Vec::new(),
        )?;
        http_response(lua, response)
    })?;
    add(
        lua,
        &t,
        state,
        "post",
        |lua, s, (url, body, headers): (String, Option<mlua::String>, Option<Table>)| {
            let caps = s.caps()?;
            let response = http::request(
                &caps.http,
                caps.transport.as_ref(),
                "POST",
                &url,
                headers_from_lua(headers)?,
                body.as_ref().map(bytes).unwrap_or_default(),
            )?;
            http_response(lua, response)
        },
    )?;
    Ok(t)
}

fn db_module(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    add(lua, &t, state, "query", |lua, s, (sql, params): (String, Option<Table>)| {
        let rows = s.caps()?.db.query_all(&sql, &params_from_lua(params)?)?;
        let build = || -> mlua::Result<Table> {
            let out = lua.create_table_with_capacity(rows.rows.len(), 0)?;
            for row in rows.rows {
                let r = lua.create_table()?;
                for (col, value) in rows.columns.iter().zip(row) {
                    r.raw_set(col.as_str(), value)?;
                }
                out.raw_push(r)?;
            }
            Ok(out)
        };
        build().map_err(|e| CapError::Io(e.to_string()))
    })?;
    add(lua, &t, state, "exec", |_, s, (sql, params): (String, Option<Table>)| {
        s.caps()?.db.exec(&sql, &params_from_lua(params)?)
    })?;
    add(lua, &t, state, "last_id", |_, s, ()| Ok(s.caps()?.db.last_id()))?;
    // Callback errors (including budget aborts) propagate as Lua errors,
    // so `each` bypasses the CapError packing used elsewhere.
    let s = Rc::clone(state);
    let each = lua.create_function(
        move |lua, (sql, params, callback): (String, Option<Table>, Function)| {
            let mut failure = None;
            let result = s.caps().and_then(|caps| {
                let params = params_from_lua(params)?;
                caps.db.query(&sql, &params, |columns, row| {
                    let call = || -> mlua::Result<bool> {
                        let r = lua.create_table()?;
                        for (col, value) in columns.iter().zip(row) {
                            r.raw_set(col.as_str(), value)?;
                        }
                        let verdict: LuaValue = callback.call(r)?;
                        Ok(verdict != LuaValue::Boolean(false))
                    };
                    match call() {
                        Ok(true) => ControlFlow::Continue(()),
                        Ok(false) => ControlFlow::Break(()),
                        Err(e) => {
                            failure = Some(e);
                            ControlFlow::Break(())
                        }
                    }
                })
            });
            if let Some(e) = failure {
                return Err(e);
            }
            reply(lua, result)
        },
    )?;
    t.raw_set("each", each)?;
    Ok(t)
}

fn crypto_module(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    add(lua, &t, state, "sha256", |_, _, data: mlua::String| {
        Ok(hex::encode(crypto::sha256(&data.as_bytes())))
    })?;
    add(lua, &t, state, "sha512", |_, _, data: mlua::String| {
        Ok(hex::encode(crypto::sha512(&data.as_bytes())))
    })?;
    add(lua, &t, state, "hmac_sha256", |_, _, (key, data): (mlua::String, mlua::String)| {
        Ok(hex::encode(crypto::hmac_sha256(&key.as_bytes(), &data.as_bytes())?))
    })?;
    add(lua, &t, state, "random", |_, _, len: usize| {
        if len == 0 || len > MAX_RANDOM_BYTES {
            return Err(CapError::InvalidArgument(format!(
                "random length must be 1..={MAX_RANDOM_BYTES}"
            )));
        }
        let mut buf = vec![0u8; len];
        crypto::random_bytes(&mut buf)?;
        Ok(hex::encode(buf))
    })?;
    add(lua, &t, state, "hash_password", |_, _, password: String| {
        crypto::hash_password(&password)
    })?;
    add(lua, &t, state, "verify_password", |_, _, (password, hash): (String, String)| {
        crypto::verify_password(&password, &hash)
    })?;
    add(lua, &t, state, "keypair", |_, _, ()| {
        let (seed, public) = crypto::ed25519_keypair()?;
        Ok((hex::encode(seed), hex::encode(public)))
    })?;
    add(lua, &t, state, "sign", |_, _, (seed, message): (String, mlua::String)| {
        let seed = crypto::parse_hex_array::<32>(&seed, "seed")?;
        Ok(hex::encode(crypto::sign(&seed, &message.as_bytes())))
    })?;
    add(
        lua,
        &t,
        state,
        "verify",
        |_, _, (public_key, message, signature): (String, mlua::String, String)| {
            let key = crypto::parse_hex_array::<32>(&public_key, "public_key")?;
            let sig = crypto::parse_hex_array::<64>(&signature, "signature")?;
            Ok(crypto::verify(&key, &message.as_bytes(), &sig))
        },
    )?;
    add(lua, &t, state, "base64_encode", |_, _, data: mlua::String| {
        Ok(B64.encode(&*data.as_bytes()))
    })?;
    add(lua, &t, state, "base64_decode", |lua, _, text: String| {
        let data = B64
            .decode(text.trim())
            .map_err(|e| CapError::InvalidArgument(format!("base64: {e}")))?;
        lua.create_string(&data).map_err(|e| CapError::Io(e.to_string()))
    })?;
    Ok(t)
}

fn smtp_module(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    add(lua, &t, state, "send", |lua, _, (config, message): (LuaValue, LuaValue)| {
        let config: smtp::SmtpConfig = lua
            .from_value(config)
            .map_err(|e| CapError::InvalidArgument(format!("smtp config: {e}")))?;
        let message: smtp::MailMessage = lua
            .from_value(message)
            .map_err(|e| CapError::InvalidArgument(format!("smtp message: {e}")))?;
        smtp::send(&config, &message)?;
        Ok(true)
    })?;
    Ok(t)
}

fn log_module(lua: &Lua) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.raw_set(
        "debug",
        lua.create_function(|_, msg: String| {
            debug!(target: "app", "{msg}");
            Ok(())
        })?,
    )?;
    t.raw_set(
        "info",
        lua.create_function(|_, msg: String| {
            info!(target: "app", "{msg}");
            Ok(())
        })?,
    )?;
    t.raw_set(
        "warn",
        lua.create_function(|_, msg: String| {
            warn!(target: "app", "{msg}");
            Ok(())
        })?,
    )?;
    t.raw_set(
        "error",
        lua.create_function(|_, msg: String| {
            error!(target: "app", "{msg}");
            Ok(())
        })?,
    )?;
    Ok(t)
}

/// Lua side of the error protocol: unwraps `ok, ...` results into values
/// or a raised error object.
const SHIM: &str = r#"
local raw_modules = ...
local error_mt = {
  __tostring = function(e) return e.kind .. ": " .. e.message end,
}
local function unwrap(ok, ...)
  if ok then return ... end
  local kind, message = ...
  error(setmetatable({ kind = kind, message = message }, error_mt), 2)
end
local modules = {}
for name, raw in pairs(raw_modules) do
  local m = {}
  for fname, f in pairs(raw) do
    m[fname] = function(...) return unwrap(f(...)) end
  end
  modules[name] = m
end
return modules
"#;

/// Builds the capability modules and installs `require`.
pub(super) fn install(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<()> {
    let raw = lua.create_table()?;
    raw.raw_set("fs", fs_module(lua, state)?)?;
    raw.raw_set("env", env_module(lua, state)?)?;
    raw.raw_set("http", http_module(lua, state)?)?;
    raw.raw_set("db", db_module(lua, state)?)?;
    raw.raw_set("crypto", crypto_module(lua, state)?)?;
    raw.raw_set("smtp", smtp_module(lua, state)?)?;

    let modules: Table = lua.load(SHIM).set_name("=capabilities").call(raw)?;
    modules.raw_set("log", log_module(lua)?)?;
    lua.set_named_registry_value(REGISTRY_MODULES, modules)?;

    let s = Rc::clone(state);
    let require = lua.create_function(move |lua, name: String| {
        if CAPABILITY_MODULES.contains(&name.as_str()) {
            let modules: Table = lua.named_registry_value(REGISTRY_MODULES)?;
            return modules.raw_get::<LuaValue>(name.as_str());
        }
        require_app_module(lua, &s, &name)
    })?;
    lua.globals().raw_set("require", require)?;
    Ok(())
}
