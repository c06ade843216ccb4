//! Legacy V2 signed URLs.
//!
//! ```text
//! StringToSign = HTTP_Verb + "\n" +
//!                Content_MD5 + "\n" +
//!                Content_Type + "\n" +
//!                Expiration + "\n" +
//!                Canonicalized_Extension_Headers +
//!                Canonicalized_Resource
//! ```
//!
//! The signature is base64 RSA-SHA256; HMAC keys cannot sign V2 URLs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};

use super::canonical::{canonical_headers, uri_encode};
use super::{SignedResource, SignedUrlConfig, SigningAlgorithm, UrlSigner};
use crate::errors::{Result, StorageError};

/// Build the V2 string to sign.
pub fn string_to_sign(resource: &SignedResource<'_>, config: &SignedUrlConfig) -> String {
    let headers = canonical_headers(
        config
            .extension_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    );
    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        config.method.as_str(),
        config.content_md5.as_deref().unwrap_or(""),
        config.content_type.as_deref().unwrap_or(""),
        config.expires.timestamp(),
        headers.block,
        resource.bucket_path()
    )
}

/// Produce a V2 signed URL.
pub async fn sign_url(
    signer: &dyn UrlSigner,
    resource: &SignedResource<'_>,
    config: &SignedUrlConfig,
    now: DateTime<Utc>,
) -> Result<String> {
    if signer.algorithm() != SigningAlgorithm::RsaSha256 {
        return Err(StorageError::InvalidArgument(
            "V2 signed URLs require an RSA (service account) signer".into(),
        ));
    }
    if config.expires <= now {
        return Err(StorageError::InvalidArgument(
            "The expiration date provided was in the past.".into(),
        ));
    }

    let blob = string_to_sign(resource, config);
    let date_stamp = now.format("%Y%m%d").to_string();
    let signature = STANDARD.encode(signer.sign(&date_stamp, blob.as_bytes()).await?);

    let mut query = format!(
        "GoogleAccessId={}&Expires={}&Signature={}",
        uri_encode(signer.credential_id(), true),
        config.expires.timestamp(),
        uri_encode(&signature, true)
    );
    for (k, v) in config.effective_query_params() {
        query.push('&');
        query.push_str(&uri_encode(&k, true));
        query.push('=');
        query.push_str(&uri_encode(&v, true));
    }

    Ok(format!(
        "{}{}?{query}",
        resource.origin(config),
        resource.path(config)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ServiceAccountKey;
    use crate::signing::{HmacSigner, ServiceAccountSigner};
    use crate::testing::TEST_SERVICE_ACCOUNT_JSON;
    use chrono::TimeZone;
    use http::Method;

    const ENDPOINT: &str = "https://storage.googleapis.com";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap()
    }

    fn in_one_hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 11, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_v2_get() {
        let signer = ServiceAccountSigner::new(
            &ServiceAccountKey::from_json(TEST_SERVICE_ACCOUNT_JSON).unwrap(),
        )
        .unwrap();
        let res = SignedResource::new(ENDPOINT, "test-bucket", Some("folder/my file.txt"));
        let config = SignedUrlConfig::read(in_one_hour());

        assert_eq!(
            string_to_sign(&res, &config),
            "GET\n\n\n1768476600\n/test-bucket/folder/my%20file.txt"
        );
        let url = sign_url(&signer, &res, &config, now()).await.unwrap();
        assert_eq!(
            url,
            "https://storage.googleapis.com/test-bucket/folder/my%20file.txt?\
             GoogleAccessId=signer%40test-project.iam.gserviceaccount.com&Expires=1768476600&\
             Signature=In%2FdqmmQGCv6bUxIsrx4NMDRpGMoy16EEZ4Z4b731KuTKKHn8fFZ7OknmLf9uKVWqjSL7g0FTDsiMJlM3eglXGJfjOQO4MPw5Wm7v5lzkBM%2FsKOtWw19Si8UbWbkJugibB2r76HNaLNaBuJ8hmolWVJA4RmugA4w%2F%2FqVgZxq45dRVrqqgjl3P1cdQmNU1dPdPOvj9n6uqvzPQvcLj1Df59Dk9oIOF%2FxF7JpRCB9p%2Fsl064h4DHFkPzf9Dv5hgaKOaHPrNG89jLn7F5guX4VziXIam089HF8yti1rU6mue5mn8cYpd7JnGXOEwkdN%2BWWmRSqABw99wnyELg2VCVPDlQ%3D%3D"
        );
    }

    #[test]
    fn test_v2_string_to_sign_with_headers() {
        let res = SignedResource::new(ENDPOINT, "test-bucket", Some("obj"));
        let mut config = SignedUrlConfig::new(Method::PUT, in_one_hour());
        config.content_md5 = Some("rmYdCNHKFXam78uCt7xQLw==".to_string());
        config.content_type = Some("text/plain".to_string());
        config
            .extension_headers
            .insert("X-Goog-Meta-A".to_string(), " b   c".to_string());
        config
            .extension_headers
            .insert("x-goog-acl".to_string(), "public-read".to_string());
        assert_eq!(
            string_to_sign(&res, &config),
            "PUT\nrmYdCNHKFXam78uCt7xQLw==\ntext/plain\n1768476600\n\
             x-goog-acl:public-read\nx-goog-meta-a:b c\n/test-bucket/obj"
        );
    }

    #[test]
    fn test_v2_resource_ignores_url_style() {
        let res = SignedResource::new(ENDPOINT, "test-bucket", Some("obj"));
        let mut config = SignedUrlConfig::read(in_one_hour());
        config.virtual_hosted_style = true;
        assert!(string_to_sign(&res, &config).ends_with("\n/test-bucket/obj"));
    }

    #[tokio::test]
    async fn test_v2_rejects_hmac_and_past_expiry() {
        let res = SignedResource::new(ENDPOINT, "b", Some("o"));
        let hmac = HmacSigner::new("id", "secret");
        let config = SignedUrlConfig::read(in_one_hour());
        assert!(sign_url(&hmac, &res, &config, now()).await.is_err());

        let signer = ServiceAccountSigner::new(
            &ServiceAccountKey::from_json(TEST_SERVICE_ACCOUNT_JSON).unwrap(),
        )
        .unwrap();
        let past = SignedUrlConfig::read(now());
        let err = sign_url(&signer, &res, &past, now()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }
}
