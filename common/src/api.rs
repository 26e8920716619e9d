use std::borrow::Cow;

use log::{info, warn};

use crate::{
    clock::Rtc,
    engine::Engine,
    error::{ErrorKind, InvalidField, Rejection, SchedulerError},
    hal::OutputFactory,
    page,
    storage::Storage,
    types::Task,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(method: &str) -> Self {
        if method.eq_ignore_ascii_case("GET") {
            Self::Get
        } else if method.eq_ignore_ascii_case("POST") {
            Self::Post
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: String,
}

impl HttpRequest {
    pub fn from_target(method: Method, target: &str, body: impl Into<String>) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
            body: body.into(),
        }
    }

    pub fn get(target: &str) -> Self {
        Self::from_target(Method::Get, target, String::new())
    }

    pub fn post(target: &str, body: impl Into<String>) -> Self {
        Self::from_target(Method::Post, target, body)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        field(&self.query, name)
    }

    pub fn form_field(&self, name: &str) -> Option<String> {
        field(&self.body, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    SetTime,
    Status,
    ApiStatus,
    DeleteTask,
    DeleteDevice,
    NewDevice,
    AddTask,
}

const ROUTES: &[(Method, &str, Route)] = &[
    (Method::Get, "/settime", Route::SetTime),
    (Method::Get, "/status", Route::Status),
    (Method::Get, "/api/status", Route::ApiStatus),
    (Method::Post, "/delete", Route::DeleteTask),
    (Method::Post, "/deletedevice", Route::DeleteDevice),
    (Method::Post, "/newdevice", Route::NewDevice),
];

impl Route {
    pub fn resolve(method: Method, path: &str) -> Option<Self> {
        let exact = ROUTES
            .iter()
            .find(|(m, p, _)| *m == method && *p == path)
            .map(|(_, _, route)| *route);
        match (exact, method) {
            (Some(route), _) => Some(route),
            (None, Method::Get) => Some(Self::Index),
            (None, Method::Post) => Some(Self::AddTask),
            (None, Method::Other) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ShowIndex,
    ShowStatus,
    ShowStatusJson,
    SetTime { hour: u32, minute: u32 },
    RemoveTask { index: usize },
    RemoveDevice { name: String },
    AddDevice { name: String, gpio: String },
    AddTask(Task),
}

impl Command {
    pub fn parse(route: Route, request: &HttpRequest) -> Result<Self, InvalidField> {
        let form = |name: &'static str| request.form_field(name).unwrap_or_default();
        match route {
            Route::Index => Ok(Self::ShowIndex),
            Route::Status => Ok(Self::ShowStatus),
            Route::ApiStatus => Ok(Self::ShowStatusJson),
            Route::SetTime => Ok(Self::SetTime {
                hour: number(request.query_param("hh"), "hh")?,
                minute: number(request.query_param("mm"), "mm")?,
            }),
            Route::DeleteTask => Ok(Self::RemoveTask {
                index: number(request.form_field("index"), "index")?,
            }),
            Route::DeleteDevice => Ok(Self::RemoveDevice { name: form("name") }),
            Route::NewDevice => Ok(Self::AddDevice {
                name: form("name").trim().to_string(),
                gpio: form("gpio").trim().to_string(),
            }),
            Route::AddTask => Task::from_fields(
                &form("device"),
                &form("start"),
                &form("end"),
                &form("recurrence"),
            )
            .map(Self::AddTask)
            .map_err(|rejection| match rejection {
                Rejection::Malformed(field) => field,
                other => InvalidField::new("task", other.to_string()),
            }),
        }
    }
}

fn number<T: std::str::FromStr>(value: Option<String>, name: &'static str) -> Result<T, InvalidField> {
    let value = value.unwrap_or_default();
    value
        .trim()
        .parse()
        .map_err(|_| InvalidField::new(name, value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Html(String),
    Json(String),
    Text { status: u16, body: &'static str },
    Redirect(&'static str),
}

impl Reply {
    pub fn status(&self) -> u16 {
        match self {
            Self::Html(_) | Self::Json(_) => 200,
            Self::Text { status, .. } => *status,
            Self::Redirect(_) => 303,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Html(_) => "text/html; charset=utf-8",
            Self::Json(_) => "application/json",
            Self::Text { .. } | Self::Redirect(_) => "text/plain; charset=utf-8",
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Html(body) | Self::Json(body) => body.as_str(),
            Self::Text { body, .. } => body,
            Self::Redirect(_) => "",
        }
    }

    pub fn location(&self) -> Option<&'static str> {
        match self {
            Self::Redirect(location) => Some(*location),
            _ => None,
        }
    }
}

const METHOD_NOT_ALLOWED: Reply = Reply::Text {
    status: 405,
    body: "Method Not Allowed",
};

/// Serves one request against the engine. Mutating requests always redirect
/// back to the page, whether or not they were accepted.
pub fn handle<R, O, S>(engine: &mut Engine<R, O, S>, request: &HttpRequest) -> Reply
where
    R: Rtc,
    O: OutputFactory,
    S: Storage,
{
    let Some(route) = Route::resolve(request.method, &request.path) else {
        return METHOD_NOT_ALLOWED;
    };

    let command = match Command::parse(route, request) {
        Ok(command) => command,
        Err(err) => {
            info!("ignoring {} {}: {err}", route_name(route), request.path);
            return match route {
                Route::SetTime => Reply::Text {
                    status: 400,
                    body: "MISSING",
                },
                _ => Reply::Redirect("/"),
            };
        }
    };

    match command {
        Command::ShowIndex => Reply::Html(page::index(&engine.status())),
        Command::ShowStatus => {
            Reply::Html(page::status_table(
                engine.tasks(),
                engine.devices().list(),
                engine.current_time(),
            ))
        }
        Command::ShowStatusJson => match serde_json::to_string(&engine.status()) {
            Ok(body) => Reply::Json(body),
            Err(err) => {
                warn!("failed to encode status: {err}");
                Reply::Text {
                    status: 500,
                    body: "FAIL",
                }
            }
        },
        Command::SetTime { hour, minute } => match engine.set_time(hour, minute) {
            Ok(_) => Reply::Text {
                status: 200,
                body: "OK",
            },
            Err(err) => {
                report("set time", &err);
                Reply::Text {
                    status: 500,
                    body: "FAIL",
                }
            }
        },
        Command::RemoveTask { index } => {
            if let Err(err) = engine.remove_task(index) {
                report("delete task", &err);
            }
            Reply::Redirect("/")
        }
        Command::RemoveDevice { name } => {
            if let Err(err) = engine.remove_device(&name) {
                report("delete device", &err);
            }
            Reply::Redirect("/")
        }
        Command::AddDevice { name, gpio } => {
            if let Err(err) = engine.add_device(&name, &gpio) {
                report("add device", &err);
            }
            Reply::Redirect("/")
        }
        Command::AddTask(task) => {
            if let Err(err) = engine.add_task(task) {
                report("add task", &err);
            }
            Reply::Redirect("/")
        }
    }
}

fn report(action: &str, err: &SchedulerError) {
    match err.kind() {
        ErrorKind::Validation | ErrorKind::Malformed => info!("{action} rejected: {err}"),
        ErrorKind::Hardware => warn!("{action} failed: {err}"),
    }
}

fn route_name(route: Route) -> &'static str {
    match route {
        Route::Index => "index",
        Route::SetTime => "settime",
        Route::Status => "status",
        Route::ApiStatus => "api status",
        Route::DeleteTask => "delete",
        Route::DeleteDevice => "deletedevice",
        Route::NewDevice => "newdevice",
        Route::AddTask => "new task",
    }
}

pub fn url_decode(text: &str) -> Cow<'_, str> {
    if !text.contains(['+', '%']) {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (bytes.get(i + 1).and_then(hex), bytes.get(i + 2).and_then(hex)) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex(byte: &u8) -> Option<u8> {
    (*byte as char).to_digit(16).map(|digit| digit as u8)
}

pub fn parse_form(text: &str) -> Vec<(String, String)> {
    text.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key).into_owned(), url_decode(value).into_owned())
        })
        .collect()
}

fn field(text: &str, name: &str) -> Option<String> {
    parse_form(text)
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualRtc,
        config::SchedulerConfig,
        hal::SimBoard,
        storage::MemoryStorage,
        types::PinRef,
    };
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    type TestEngine = Engine<ManualRtc, SimBoard, MemoryStorage>;

    fn engine(board: &SimBoard) -> TestEngine {
        let now = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        Engine::boot(
            SchedulerConfig::default(),
            ManualRtc::at(now),
            board.clone(),
            MemoryStorage::new(),
        )
    }

    #[test]
    fn decodes_plus_and_percent_escapes() {
        assert_eq!(url_decode("Water+Pump"), "Water Pump");
        assert_eq!(url_decode("06%3A30"), "06:30");
        assert_eq!(url_decode("caf%C3%A9"), "café");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz1"), "%zz1");
        assert_eq!(
            parse_form("device=Pi+LED&start=06%3A00&flag"),
            vec![
                ("device".to_string(), "Pi LED".to_string()),
                ("start".to_string(), "06:00".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn routes_fall_back_by_method() {
        assert_eq!(Route::resolve(Method::Get, "/settime"), Some(Route::SetTime));
        assert_eq!(Route::resolve(Method::Get, "/settimezone"), Some(Route::Index));
        assert_eq!(Route::resolve(Method::Get, "/"), Some(Route::Index));
        assert_eq!(Route::resolve(Method::Get, "/favicon.ico"), Some(Route::Index));
        assert_eq!(Route::resolve(Method::Post, "/newdevice"), Some(Route::NewDevice));
        assert_eq!(Route::resolve(Method::Post, "/anything"), Some(Route::AddTask));
        assert_eq!(Route::resolve(Method::Post, "/status"), Some(Route::AddTask));
        assert_eq!(Route::resolve(Method::Other, "/"), None);
    }

    #[test]
    fn settime_reports_missing_and_failed_values() {
        let board = SimBoard::new();
        let mut engine = engine(&board);

        let reply = handle(&mut engine, &HttpRequest::get("/settime?hh=18&mm=5"));
        assert_eq!(reply.status(), 200);
        assert_eq!(reply.body(), "OK");
        assert_eq!(engine.current_time().to_string(), "18:05");

        let reply = handle(&mut engine, &HttpRequest::get("/settime?hh=18"));
        assert_eq!((reply.status(), reply.body()), (400, "MISSING"));
        let reply = handle(&mut engine, &HttpRequest::get("/settime?hh=x&mm=1"));
        assert_eq!((reply.status(), reply.body()), (400, "MISSING"));

        let reply = handle(&mut engine, &HttpRequest::get("/settime?hh=25&mm=0"));
        assert_eq!((reply.status(), reply.body()), (500, "FAIL"));
        assert_eq!(engine.current_time().to_string(), "18:05");
    }

    #[test]
    fn form_posts_mutate_and_redirect() {
        let board = SimBoard::new();
        let mut engine = engine(&board);

        let reply = handle(
            &mut engine,
            &HttpRequest::post("/newdevice", "name=Water+Pump&gpio=2"),
        );
        assert_eq!(reply.location(), Some("/"));
        assert!(engine.devices().get("Water Pump").is_some());

        let reply = handle(
            &mut engine,
            &HttpRequest::post(
                "/",
                "device=Water+Pump&start=06%3A00&end=06%3A05&recurrence=once",
            ),
        );
        assert_eq!(reply.status(), 303);
        assert_eq!(engine.tasks().len(), 1);

        engine.tick();
        assert!(board.is_high(PinRef::Gpio(2)));

        let reply = handle(&mut engine, &HttpRequest::post("/delete", "index=0"));
        assert_eq!(reply.status(), 303);
        assert!(engine.tasks().is_empty());
        assert!(!board.is_high(PinRef::Gpio(2)));

        let reply = handle(
            &mut engine,
            &HttpRequest::post("/deletedevice", "name=Water+Pump"),
        );
        assert_eq!(reply.status(), 303);
        assert!(engine.devices().get("Water Pump").is_none());
    }

    #[test]
    fn rejected_posts_still_redirect_without_change() {
        let board = SimBoard::new();
        let mut engine = engine(&board);

        for (path, body) in [
            ("/newdevice", "name=Fan&gpio=7"),
            ("/newdevice", "name=&gpio=3"),
            ("/deletedevice", "name=Pi+LED"),
            ("/deletedevice", "name=Ghost"),
            ("/delete", "index=3"),
            ("/delete", "index=abc"),
            ("/", "device=Pi+LED&start=6pm&end=07:00&recurrence=once"),
            ("/", "device=Pi+LED&start=06:00&end=07:00&recurrence=weekly"),
        ] {
            let reply = handle(&mut engine, &HttpRequest::post(path, body));
            assert_eq!(reply.location(), Some("/"), "{path} {body}");
        }

        let names: Vec<_> = engine.devices().list().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Pi LED"]);
        assert!(engine.tasks().is_empty());
    }

    #[test]
    fn status_views_render_current_state() {
        let board = SimBoard::new();
        let mut engine = engine(&board);
        handle(
            &mut engine,
            &HttpRequest::post("/", "device=Pi+LED&start=05:00&end=06:00&recurrence=daily"),
        );

        let reply = handle(&mut engine, &HttpRequest::get("/status"));
        assert_eq!(reply.content_type(), "text/html; charset=utf-8");
        assert!(reply.body().contains("class='expired'"));
        assert!(reply.body().contains("<td>Pi LED ON</td>"));

        let reply = handle(&mut engine, &HttpRequest::get("/api/status"));
        let json: serde_json::Value = serde_json::from_str(reply.body()).unwrap();
        assert_eq!(json["time"], "06:00");
        assert_eq!(json["tasks"][0]["start_time"], "05:00");
        assert_eq!(json["devices"][0]["gpio"], "LED");

        let reply = handle(&mut engine, &HttpRequest::get("/"));
        assert!(reply.body().contains("06:00"));
        assert_eq!(
            handle(&mut engine, &HttpRequest::from_target(Method::Other, "/", "")).status(),
            405
        );
    }
}
