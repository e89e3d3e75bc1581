// CONTROL SOCKET CLIENT: ONE REQUEST, PRINT THE REPLY, NONZERO EXIT ON ERR

use std::path::Path;

use anyhow::{bail, Context, Result};

use corewarden::control;

fn send(socket: &Path, line: &str) -> Result<String> {
    let reply = control::request(socket, line)
        .with_context(|| format!("IS THE DAEMON RUNNING? ({})", socket.display()))?;
    if let Some(msg) = reply.lines().find_map(|l| l.strip_prefix("ERR ")) {
        bail!("{}", msg);
    }
    Ok(reply)
}

// MULTI-LINE REPLIES END IN "OK"
fn print_body(reply: &str) {
    for line in reply.lines().filter(|l| *l != "OK") {
        println!("{}", line);
    }
}

pub fn run_get(socket: &Path, name: &str) -> Result<()> {
    print!("{}", send(socket, &format!("get {}", name))?);
    Ok(())
}

pub fn run_set(socket: &Path, name: &str, value: &str) -> Result<()> {
    send(socket, &format!("set {} {}", name, value))?;
    println!("{} = {}", name, value.trim());
    Ok(())
}

pub fn run_list(socket: &Path) -> Result<()> {
    let reply = send(socket, "list")?;
    for line in reply.lines().filter(|l| *l != "OK") {
        if let Some((name, value)) = line.split_once(' ') {
            println!("{:<24}{}", name, value);
        }
    }
    Ok(())
}

pub fn run_status(socket: &Path) -> Result<()> {
    print_body(&send(socket, "status")?);
    Ok(())
}
