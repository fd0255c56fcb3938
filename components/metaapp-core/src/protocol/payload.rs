/// The JSON document inscribed as a MetaApp payload. Keys are camelCase on
/// chain; absent keys decode to their defaults so a minimal
/// `{"title":…,"code":…}` payload is acceptable.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MetaAppPayload {
    pub title: String,
    pub app_name: String,
    pub prompt: String,
    pub icon: String,
    pub cover_img: String,
    pub intro_imgs: Vec<String>,
    pub intro: String,
    pub runtime: String,
    pub index_file: String,
    pub version: String,
    pub content_type: String,
    pub content: String,
    pub code: String,
    pub content_hash: String,
    pub metadata: String,
    pub disabled: bool,
}

pub fn parse_metaapp_payload(bytes: &[u8]) -> Result<MetaAppPayload, String> {
    let mut payload: MetaAppPayload = serde_json::from_slice(bytes)
        .map_err(|e| format!("unable to parse metaapp payload: {}", e))?;
    if payload.metadata.is_empty() {
        payload.metadata = "{}".to_string();
    }
    Ok(payload)
}

#[cfg(test)]
mod test {
    use super::parse_metaapp_payload;

    #[test]
    fn full_payload_is_decoded() {
        let payload = parse_metaapp_payload(
            br#"{
                "title": "orders.exchange",
                "appName": "orders",
                "icon": "metafile://icon",
                "coverImg": "metafile://cover",
                "introImgs": ["metafile://a", "metafile://b"],
                "intro": "introduction about this app",
                "runtime": "browser",
                "indexFile": "index.html",
                "version": "v1.0.0",
                "contentType": "/protocols/metatree",
                "content": "pinid",
                "code": "metafile://pinid",
                "contentHash": "xxx",
                "metadata": "{\"a\":1}",
                "disabled": false
            }"#,
        )
        .unwrap();
        assert_eq!(payload.title, "orders.exchange");
        assert_eq!(payload.app_name, "orders");
        assert_eq!(payload.intro_imgs.len(), 2);
        assert_eq!(payload.code, "metafile://pinid");
        assert_eq!(payload.metadata, "{\"a\":1}");
        assert!(!payload.disabled);
    }

    #[test]
    fn sparse_payload_falls_back_to_defaults() {
        let payload = parse_metaapp_payload(br#"{"title":"t"}"#).unwrap();
        assert_eq!(payload.title, "t");
        assert_eq!(payload.code, "");
        assert_eq!(payload.metadata, "{}");
        assert!(payload.intro_imgs.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_metaapp_payload(b"{not json").is_err());
        assert!(parse_metaapp_payload(b"").is_err());
    }
}
