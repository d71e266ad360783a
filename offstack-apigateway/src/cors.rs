//! CORS response stage
//!
//! Runs after the integration, for every response to a request that carries
//! an `Origin` header. Headers the handler set itself are left alone.

use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};

use crate::endpoint::{CorsDescriptor, GatewayOptions, HttpApiCors};

const DEFAULT_EXPOSE_HEADERS: &str = "content-type, content-length, etag";
const PREFLIGHT_MAX_AGE: &str = "600";

fn set(response: &mut Response, name: HeaderName, value: &str) {
    if response.headers().contains_key(&name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn request_header<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Whether this is a preflight the gateway should answer itself
pub fn is_preflight(options: &GatewayOptions, method: &Method, headers: &HeaderMap) -> bool {
    !options.disable_cors && method == Method::OPTIONS && headers.contains_key(header::ORIGIN)
}

/// Add CORS headers to `response`
pub fn decorate(
    options: &GatewayOptions,
    cors: Option<&CorsDescriptor>,
    method: &Method,
    request_headers: &HeaderMap,
    mut response: Response,
) -> Response {
    if options.disable_cors {
        return response;
    }
    let Some(origin) = request_header(request_headers, &header::ORIGIN).map(ToString::to_string) else {
        return response;
    };
    let preflight = method == Method::OPTIONS;

    if let Some(policy) = &options.http_api_cors {
        apply_http_api_policy(policy, &origin, preflight, &mut response);
        return response;
    }

    if let Some(cors) = cors {
        if !cors.origins.iter().any(|allowed| allowed == "*" || *allowed == origin) {
            return response;
        }
        set(&mut response, header::ACCESS_CONTROL_ALLOW_ORIGIN, &origin);
        if cors.credentials {
            set(&mut response, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
        if preflight {
            *response.status_mut() = StatusCode::OK;
            set(&mut response, header::ACCESS_CONTROL_ALLOW_HEADERS, &cors.headers.join(","));
            let exposed = if cors.exposed_headers.is_empty() {
                DEFAULT_EXPOSE_HEADERS.to_string()
            } else {
                cors.exposed_headers.join(",")
            };
            set(&mut response, header::ACCESS_CONTROL_EXPOSE_HEADERS, &exposed);
            set(&mut response, header::ACCESS_CONTROL_MAX_AGE, PREFLIGHT_MAX_AGE);
            if let Some(requested) = request_header(request_headers, &header::ACCESS_CONTROL_REQUEST_METHOD) {
                set(&mut response, header::ACCESS_CONTROL_ALLOW_METHODS, requested);
            }
        }
        return response;
    }

    set(&mut response, header::ACCESS_CONTROL_ALLOW_ORIGIN, &origin);
    set(&mut response, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    if preflight {
        *response.status_mut() = StatusCode::OK;
        let exposed = request_header(request_headers, &header::ACCESS_CONTROL_EXPOSE_HEADERS)
            .unwrap_or(DEFAULT_EXPOSE_HEADERS)
            .to_string();
        set(&mut response, header::ACCESS_CONTROL_EXPOSE_HEADERS, &exposed);
        set(&mut response, header::ACCESS_CONTROL_MAX_AGE, PREFLIGHT_MAX_AGE);
        if let Some(requested) = request_header(request_headers, &header::ACCESS_CONTROL_REQUEST_HEADERS) {
            let requested = requested.to_string();
            set(&mut response, header::ACCESS_CONTROL_ALLOW_HEADERS, &requested);
        }
        if let Some(requested) = request_header(request_headers, &header::ACCESS_CONTROL_REQUEST_METHOD) {
            let requested = requested.to_string();
            set(&mut response, header::ACCESS_CONTROL_ALLOW_METHODS, &requested);
        }
    }
    response
}

fn apply_http_api_policy(policy: &HttpApiCors, origin: &str, preflight: bool, response: &mut Response) {
    if preflight {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    if !policy.allows_origin(origin) {
        return;
    }

    set(response, header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    if policy.allow_credentials {
        set(response, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    }
    if let Some(max_age) = policy.max_age {
        set(response, header::ACCESS_CONTROL_MAX_AGE, &max_age.to_string());
    }
    if !policy.exposed_response_headers.is_empty() {
        set(response, header::ACCESS_CONTROL_EXPOSE_HEADERS, &policy.exposed_response_headers.join(","));
    }
    if !policy.allowed_methods.is_empty() {
        set(response, header::ACCESS_CONTROL_ALLOW_METHODS, &policy.allowed_methods.join(","));
    }
    if !policy.allowed_headers.is_empty() {
        set(response, header::ACCESS_CONTROL_ALLOW_HEADERS, &policy.allowed_headers.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn empty() -> Response {
        Response::new(Body::empty())
    }

    #[test]
    fn test_permissive_default() {
        let request = headers(&[("origin", "http://app.local")]);
        let response = decorate(&GatewayOptions::default(), None, &Method::GET, &request, empty());
        assert_eq!(response.headers()["access-control-allow-origin"], "http://app.local");
        assert_eq!(response.headers()["access-control-allow-credentials"], "true");
        assert!(response.headers().get("access-control-max-age").is_none());
    }

    #[test]
    fn test_permissive_preflight() {
        let request = headers(&[
            ("origin", "http://app.local"),
            ("access-control-request-headers", "x-custom"),
            ("access-control-request-method", "PUT"),
        ]);
        let response = decorate(&GatewayOptions::default(), None, &Method::OPTIONS, &request, empty());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-max-age"], "600");
        assert_eq!(response.headers()["access-control-allow-headers"], "x-custom");
        assert_eq!(response.headers()["access-control-allow-methods"], "PUT");
        assert_eq!(response.headers()["access-control-expose-headers"], DEFAULT_EXPOSE_HEADERS);
    }

    #[test]
    fn test_handler_headers_win() {
        let request = headers(&[("origin", "http://app.local")]);
        let mut response = empty();
        response
            .headers_mut()
            .insert("access-control-allow-origin", HeaderValue::from_static("*"));
        let response = decorate(&GatewayOptions::default(), None, &Method::GET, &request, response);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[test]
    fn test_endpoint_declaration_restricts_origins() {
        let cors = CorsDescriptor {
            origins: vec!["http://allowed.local".to_string()],
            ..CorsDescriptor::default()
        };
        let blocked = decorate(
            &GatewayOptions::default(),
            Some(&cors),
            &Method::GET,
            &headers(&[("origin", "http://other.local")]),
            empty(),
        );
        assert!(blocked.headers().get("access-control-allow-origin").is_none());

        let allowed = decorate(
            &GatewayOptions::default(),
            Some(&cors),
            &Method::GET,
            &headers(&[("origin", "http://allowed.local")]),
            empty(),
        );
        assert_eq!(allowed.headers()["access-control-allow-origin"], "http://allowed.local");
        assert!(allowed.headers().get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn test_http_api_policy() {
        let options = GatewayOptions {
            http_api_cors: Some(HttpApiCors {
                allowed_origins: vec!["http://app.local".to_string()],
                allowed_methods: vec!["GET".to_string(), "POST".to_string()],
                allow_credentials: true,
                max_age: Some(300),
                ..HttpApiCors::default()
            }),
            ..GatewayOptions::default()
        };
        let preflight = decorate(
            &options,
            None,
            &Method::OPTIONS,
            &headers(&[("origin", "http://app.local")]),
            empty(),
        );
        assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
        assert_eq!(preflight.headers()["access-control-allow-methods"], "GET,POST");
        assert_eq!(preflight.headers()["access-control-max-age"], "300");

        let other = decorate(&options, None, &Method::OPTIONS, &headers(&[("origin", "http://evil.local")]), empty());
        assert_eq!(other.status(), StatusCode::NO_CONTENT);
        assert!(other.headers().get("access-control-allow-origin").is_none());
    }

    #[test]
    fn test_disabled_and_no_origin() {
        let options = GatewayOptions {
            disable_cors: true,
            ..GatewayOptions::default()
        };
        let request = headers(&[("origin", "http://app.local")]);
        assert!(decorate(&options, None, &Method::GET, &request, empty()).headers().is_empty());
        assert!(decorate(&GatewayOptions::default(), None, &Method::GET, &HeaderMap::new(), empty())
            .headers()
            .is_empty());
    }
}
