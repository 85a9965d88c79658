use anyhow::Result;

use crate::cache_key::derive;

pub fn execute(urls: Vec<String>, domain: Option<String>) -> Result<()> {
    let (key, normalized) = derive(&urls, domain.as_deref())?;
    log::debug!("{} distinct urls", normalized.len());
    println!("{key}");
    Ok(())
}
