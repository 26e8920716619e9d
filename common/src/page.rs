use std::borrow::Cow;

use crate::{
    engine::StatusSnapshot,
    registry::MAX_NAME_CHARS,
    types::{Device, Task, TimeOfDay},
};

const STYLE: &str = r#"
body { font-family: Arial, sans-serif; margin: 0; padding: 18px; display: flex; flex-direction: column; align-items: center; background: #f4f4f4; }
h2 { margin-top: 12px; font-size: 20px; color: #333; }
.container { width: 100%; max-width: 350px; background: #fff; padding: 25px; border-radius: 12px; box-shadow: 0 0 12px rgba(0,0,0,0.12); border-top: 6px solid #e84d00; margin-top: 14px; }
p { font-size: 14px; margin: 0 0 14px 0; color: #222; }
form { display: flex; flex-direction: column; gap: 14px; margin: 6px 0 14px 0; }
label { font-size: 13px; font-weight: 600; color: #333; }
input[type=time], select, input[type=text] { padding: 8px; font-size: 14px; border-radius: 8px; border: 1px solid #ccc; }
input[type=submit], button { padding: 8px; font-size: 14px; background: #e84d00; color: #fff; border: none; border-radius: 8px; cursor: pointer; }
table { width: 100%; border-collapse: collapse; margin-top: 14px; font-size: 13px; }
th { background: #e84d00; color: #fff; padding: 8px; }
td { padding: 8px; border: 1px solid #eee; text-align: center; }
.expired { background: #ddd; color: #777; }
.hidden { display: none; }
.device-row { display: flex; justify-content: space-between; align-items: center; margin-bottom: 6px; }
.device-row form { margin: 0; }
@media (max-width: 600px) { body { padding: 14px; } .container { max-width: 300px; padding: 18px; } table, th, td { font-size: 12px; } }
"#;

// Pushes the browser's clock once per load, then polls the task table.
const SCRIPT: &str = r#"
window.onload = function () {
  try {
    const now = new Date();
    fetch(`/settime?hh=${now.getHours()}&mm=${now.getMinutes()}`);
  } catch (e) {}
};
function updateTable() {
  fetch("/status")
    .then((res) => res.text())
    .then((html) => { document.getElementById("task_table").innerHTML = html; })
    .catch(() => {});
}
setInterval(updateTable, 5000);
"#;

pub fn escape_html(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

pub fn status_table(tasks: &[Task], devices: &[Device], now: TimeOfDay) -> String {
    let mut html = String::from(
        "<table><tr><th>Device</th><th>Action</th><th>Start</th><th>End</th>\
         <th>Recurrence</th><th>Del</th></tr>",
    );
    for (index, task) in tasks.iter().enumerate() {
        let class = if task.end <= now { " class='expired'" } else { "" };
        let device = escape_html(&task.device);
        let action = if devices.iter().any(|known| known.name == task.device) {
            format!("{device} ON")
        } else {
            "ON".to_string()
        };
        html.push_str(&format!(
            "<tr{class}><td>{device}</td><td>{action}</td><td>{start}</td><td>{end}</td><td>{recurrence}</td>\
             <td><form action='/delete' method='POST'><input type='hidden' name='index' value='{index}'>\
             <button type='submit'>X</button></form></td></tr>",
            start = task.start,
            end = task.end,
            recurrence = task.recurrence,
        ));
    }
    html.push_str("</table>");
    html
}

pub fn index(status: &StatusSnapshot) -> String {
    let mut gpio_options = String::new();
    for gpio in &status.free_gpio {
        gpio_options.push_str(&format!("<option value='{gpio}'>{gpio}</option>"));
    }

    let mut device_options = String::new();
    let mut device_rows = String::new();
    for device in &status.devices {
        let name = escape_html(&device.name);
        device_options.push_str(&format!("<option value='{name}'>{name}</option>"));
        if device.pin.is_onboard() {
            continue;
        }
        device_rows.push_str(&format!(
            "<div class='device-row'><span>{name} (GPIO {pin})</span>\
             <form action='/deletedevice' method='POST'><input type='hidden' name='name' value='{name}'>\
             <button type='submit'>Delete</button></form></div>",
            pin = device.pin,
        ));
    }

    format!(
        r#"<!doctype html>
<html><head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Device Scheduler</title>
<style>{STYLE}</style>
</head><body>
<h2>Device Scheduler</h2>
<div class="container">
  <p><b>Current Time: {time}</b></p>
  <button onclick="document.getElementById('new_device_form').classList.toggle('hidden')">Create New Device</button>
  <form id="new_device_form" class="hidden" action="/newdevice" method="POST">
    <label>Device Name:</label>
    <input type="text" name="name" maxlength="{max_name}" required>
    <label>GPIO Pin:</label>
    <select name="gpio" required>{gpio_options}</select>
    <input type="submit" value="Add Device">
  </form>
  <form action="/" method="POST">
    <label>Device:</label>
    <select name="device" required>{device_options}</select>
    <label>Start Time:</label>
    <input type="time" name="start" required>
    <label>End Time:</label>
    <input type="time" name="end" required>
    <label>Recurrence:</label>
    <select name="recurrence">
      <option value="once">Once</option>
      <option value="daily">Daily</option>
    </select>
    <input type="submit" value="Add Task">
  </form>
  <h3>Devices:</h3>
  {device_rows}
  <h3>Scheduled Tasks:</h3>
  <div id="task_table">{table}</div>
</div>
<script>{SCRIPT}</script>
</body></html>
"#,
        time = status.time,
        table = status_table(&status.tasks, &status.devices, status.time),
        max_name = MAX_NAME_CHARS,
    )
}
