use rust_embed::RustEmbed;

/// Web UI bundled into the binary and served byte-for-byte.
#[derive(RustEmbed)]
#[folder = "assets/"]
struct StaticAssets;

/// A bundled file and its content type.
pub struct Asset {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Look up a bundled file by its path relative to the asset root.
pub fn get(path: &str) -> Option<Asset> {
    let path = path.trim_start_matches('/');
    if path.is_empty() || path.split('/').any(|segment| segment == "..") {
        return None;
    }
    let file = StaticAssets::get(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Some(Asset {
        data: file.data.into_owned(),
        content_type: mime.essence_str().to_string(),
    })
}
