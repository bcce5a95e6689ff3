use serde_json::Value;

use crate::error::TwinError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Json,
    Human,
}

pub fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

pub fn print_error(err: &TwinError, mode: OutputMode) {
    match mode {
        OutputMode::Json => {
            let resp = crate::error::ErrorResponse::from(err);
            match serde_json::to_string(&resp) {
                Ok(text) => eprintln!("{text}"),
                Err(_) => eprintln!("error: {err}"),
            }
        }
        OutputMode::Human => {
            eprintln!("error: {err}");
        }
    }
}

/// Field values flattened to one line, skipping nested objects.
fn summarize_fields(data: &Value) -> String {
    let Some(map) = data.as_object() else {
        return String::new();
    };
    map.iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            Value::Array(a) => format!("{k}=[{}]", a.len()),
            Value::Object(_) => format!("{k}={{..}}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn print_record(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let id = value["id"].as_str().unwrap_or("?");
            let kind = value["kind"].as_str().unwrap_or("?");
            let fields = summarize_fields(&value["data"]);
            println!("{id:<16} [{kind}] {fields}");
        }
    }
}

pub fn print_record_detail(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let id = value["id"].as_str().unwrap_or("?");
            let kind = value["kind"].as_str().unwrap_or("?");
            let object_id = value["object_id"].as_str().unwrap_or("?");
            let created = value["created_at"].as_str().unwrap_or("?");
            let updated = value["updated_at"].as_str().unwrap_or("?");

            println!("{id}  [{kind}]");
            println!("  object: {object_id}");
            println!("  created: {created}  updated: {updated}");

            if let Some(map) = value["data"].as_object()
                && !map.is_empty()
            {
                println!("  data:");
                for (k, v) in map {
                    match v {
                        Value::String(s) => println!("    {k}: {s}"),
                        other => println!("    {k}: {other}"),
                    }
                }
            }
        }
    }
}

pub fn print_record_list(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            if let Some(arr) = value.as_array() {
                if arr.is_empty() {
                    println!("(no records)");
                } else {
                    for item in arr {
                        print_record(item, OutputMode::Human);
                    }
                }
            }
        }
    }
}

pub fn print_events(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            if let Some(arr) = value.as_array() {
                if arr.is_empty() {
                    println!("(no events)");
                } else {
                    for ev in arr {
                        let etype = ev["event_type"].as_str().unwrap_or("?");
                        let actor = ev["actor"].as_str().unwrap_or("-");
                        let at = ev["created_at"].as_str().unwrap_or("?");
                        let detail = ev["detail"].as_str().unwrap_or("");
                        if detail.is_empty() {
                            println!("  {at}  {etype} by {actor}");
                        } else {
                            println!("  {at}  {etype} by {actor}: {detail}");
                        }
                    }
                }
            }
        }
    }
}

pub fn print_next_id(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            println!("{}", value["id"].as_str().unwrap_or("?"));
        }
    }
}

pub fn print_kinds(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            if let Some(arr) = value.as_array() {
                for k in arr {
                    let kind = k["kind"].as_str().unwrap_or("?");
                    let example = k["example"].as_str().unwrap_or("?");
                    let width = k["pad_width"].as_u64().unwrap_or(0);
                    let daily = if k["date_scoped"].as_bool().unwrap_or(false) {
                        " (resets daily)"
                    } else {
                        ""
                    };
                    let required: Vec<&str> = k["required_fields"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                        .unwrap_or_default();
                    println!(
                        "{kind:<16} {example:<16} width {width}{daily}  requires: {}",
                        required.join(", ")
                    );
                }
            }
        }
    }
}

pub fn print_status(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let strategy = value["strategy"].as_str().unwrap_or("?");
            println!("allocation: {strategy}");
            if let Some(arr) = value["kinds"].as_array() {
                for entry in arr {
                    let kind = entry["kind"].as_str().unwrap_or("?");
                    let count = entry["count"].as_i64().unwrap_or(0);
                    let latest = entry["latest_id"].as_str().unwrap_or("-");
                    println!("  {kind:<16} {count:>6}  latest: {latest}");
                }
            }
        }
    }
}
