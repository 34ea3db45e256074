//! Init command: ensure this instance has a stable identity.

use std::io::Write;

use anyhow::Result;

use crate::identity;

pub fn run<W: Write>(writer: &mut W, label: Option<&str>) -> Result<()> {
    let identity = identity::current(label)?;
    writeln!(writer, "Instance: {} ({})", identity.instance_id, identity.label)?;
    Ok(())
}
