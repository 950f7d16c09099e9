use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use cognito_local::cognito::server::create_router;
use cognito_local::cognito::state::{CognitoService, ServiceOptions};
use cognito_local::cognito::triggers::TriggerRuntime;
use cognito_local::cognito::types::{CreateUserPoolClientRequest, CreateUserPoolRequest};

struct Fixture {
    dir: tempfile::TempDir,
    service: Arc<CognitoService>,
    app: Router,
    pool_id: String,
    client_id: String,
}

async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(
        CognitoService::open(ServiceOptions {
            data_dir: dir.path().to_path_buf(),
            issuer: "http://localhost:9229".into(),
            triggers: TriggerRuntime::empty(),
            deterministic_codes: true,
        })
        .await
        .unwrap(),
    );
    let pool = service
        .create_user_pool(CreateUserPoolRequest {
            pool_name: "wire".into(),
            policies: None,
            mfa_configuration: None,
            auto_verified_attributes: vec!["email".into()],
            schema: vec![],
        })
        .await
        .unwrap();
    let pool_id = pool.user_pool.id;
    let client = service
        .create_user_pool_client(CreateUserPoolClientRequest {
            user_pool_id: pool_id.clone(),
            client_name: "app".into(),
            generate_secret: false,
            explicit_auth_flows: vec![],
            read_attributes: vec![],
            write_attributes: vec![],
            access_token_validity: None,
            id_token_validity: None,
            refresh_token_validity: None,
        })
        .await
        .unwrap();

    Fixture {
        app: create_router(service.clone()),
        dir,
        service,
        pool_id,
        client_id: client.user_pool_client.client_id,
    }
}

async fn target(app: &Router, name: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header(
                    "x-amz-target",
                    format!("AWSCognitoIdentityProviderService.{name}"),
                )
                .header("content-type", "application/x-amz-json-1.1")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn jwks_endpoint_serves_the_signing_key() {
    let fixture = setup().await;
    let (status, body) = get(
        &fixture.app,
        &format!("/{}/.well-known/jwks.json", fixture.pool_id),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let keys = body["keys"].as_array().expect("keys array");
    assert_eq!(keys.len(), 1);
    let key = &keys[0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["use"], "sig");
    assert!(key["kid"].is_string());
    assert!(key["n"].is_string());
    assert_eq!(key["e"], "AQAB");
}

#[tokio::test]
async fn openid_configuration_document() {
    let fixture = setup().await;
    let (status, body) = get(
        &fixture.app,
        &format!("/{}/.well-known/openid-configuration", fixture.pool_id),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let issuer = format!("http://localhost:9229/{}", fixture.pool_id);
    assert_eq!(body["issuer"], issuer);
    assert_eq!(body["jwks_uri"], format!("{issuer}/.well-known/jwks.json"));
    assert_eq!(body["id_token_signing_alg_values_supported"], json!(["RS256"]));
}

#[tokio::test]
async fn access_tokens_verify_against_the_published_jwks() {
    let fixture = setup().await;
    target(
        &fixture.app,
        "AdminCreateUser",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "alice",
            "MessageAction": "SUPPRESS",
        }),
    )
    .await;
    target(
        &fixture.app,
        "AdminSetUserPassword",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "alice",
            "Password": "p@ssword1",
            "Permanent": true,
        }),
    )
    .await;

    let (status, login) = target(
        &fixture.app,
        "InitiateAuth",
        json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": fixture.client_id,
            "AuthParameters": { "USERNAME": "alice", "PASSWORD": "p@ssword1" },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let access_token = login["AuthenticationResult"]["AccessToken"].as_str().unwrap();

    let (_, jwks) = get(
        &fixture.app,
        &format!("/{}/.well-known/jwks.json", fixture.pool_id),
    )
    .await;
    let key = &jwks["keys"][0];
    let decoding_key =
        DecodingKey::from_rsa_components(key["n"].as_str().unwrap(), key["e"].as_str().unwrap())
            .unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_aud = false;

    let decoded =
        jsonwebtoken::decode::<Value>(access_token, &decoding_key, &validation).unwrap();
    let claims = decoded.claims;
    assert_eq!(claims["token_use"], "access");
    assert_eq!(claims["client_id"], fixture.client_id.as_str());
    assert_eq!(claims["username"], "alice");

    let pool = fixture.service.get_user_pool(&fixture.pool_id).await.unwrap();
    let alice = pool.get_user_by_username("alice").await.unwrap();
    assert_eq!(claims["sub"], alice.sub().unwrap());
    let exp = claims["exp"].as_i64().unwrap();
    let iat = claims["iat"].as_i64().unwrap();
    assert_eq!(exp - iat, 3600);
}

#[tokio::test]
async fn sign_up_and_confirm_with_recorded_code() {
    let fixture = setup().await;

    let (status, signed_up) = target(
        &fixture.app,
        "SignUp",
        json!({
            "ClientId": fixture.client_id,
            "Username": "dave",
            "Password": "secretpw1",
            "UserAttributes": [{ "Name": "email", "Value": "dave@example.com" }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(signed_up["UserConfirmed"], false);
    assert!(signed_up["UserSub"].is_string());
    assert_eq!(
        signed_up["CodeDeliveryDetails"]["DeliveryMedium"],
        "EMAIL"
    );

    // The delivery log records the code instead of sending it.
    let log = std::fs::read_to_string(fixture.dir.path().join("messages.log")).unwrap();
    let record: Value = serde_json::from_str(log.lines().last().unwrap()).unwrap();
    let code = record["code"].as_str().unwrap().to_string();

    let (status, body) = target(
        &fixture.app,
        "ConfirmSignUp",
        json!({
            "ClientId": fixture.client_id,
            "Username": "dave",
            "ConfirmationCode": "000000",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "CodeMismatchException");

    let (status, _) = target(
        &fixture.app,
        "ConfirmSignUp",
        json!({
            "ClientId": fixture.client_id,
            "Username": "dave",
            "ConfirmationCode": code,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, user) = target(
        &fixture.app,
        "AdminGetUser",
        json!({ "UserPoolId": fixture.pool_id, "Username": "dave" }),
    )
    .await;
    assert_eq!(user["UserStatus"], "CONFIRMED");
}

#[tokio::test]
async fn forgot_password_round_trip() {
    let fixture = setup().await;
    target(
        &fixture.app,
        "AdminCreateUser",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "erin",
            "MessageAction": "SUPPRESS",
            "UserAttributes": [{ "Name": "email", "Value": "erin@example.com" }],
        }),
    )
    .await;
    target(
        &fixture.app,
        "AdminSetUserPassword",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "erin",
            "Password": "oldpass-1",
            "Permanent": true,
        }),
    )
    .await;

    let (status, body) = target(
        &fixture.app,
        "ForgotPassword",
        json!({ "ClientId": fixture.client_id, "Username": "erin" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["CodeDeliveryDetails"]["AttributeName"], "email");

    let log = std::fs::read_to_string(fixture.dir.path().join("messages.log")).unwrap();
    let record: Value = serde_json::from_str(log.lines().last().unwrap()).unwrap();
    assert_eq!(record["source"], "CustomMessage_ForgotPassword");
    let code = record["code"].as_str().unwrap().to_string();

    let (status, _) = target(
        &fixture.app,
        "ConfirmForgotPassword",
        json!({
            "ClientId": fixture.client_id,
            "Username": "erin",
            "ConfirmationCode": code,
            "Password": "newpass-1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, login) = target(
        &fixture.app,
        "InitiateAuth",
        json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": fixture.client_id,
            "AuthParameters": { "USERNAME": "erin", "PASSWORD": "newpass-1" },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(login["AuthenticationResult"]["AccessToken"].is_string());
}

#[tokio::test]
async fn error_shapes_on_the_wire() {
    let fixture = setup().await;

    // Unknown target name.
    let (status, body) = target(&fixture.app, "DanceParty", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "UnsupportedOperationException");
    assert!(body["message"].is_string());

    // Unknown pool.
    let (status, body) = target(
        &fixture.app,
        "DescribeUserPool",
        json!({ "UserPoolId": "local_missing" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "ResourceNotFoundException");

    // Unsupported auth flow.
    let (status, body) = target(
        &fixture.app,
        "InitiateAuth",
        json!({
            "AuthFlow": "CUSTOM_AUTH",
            "ClientId": fixture.client_id,
            "AuthParameters": {},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "UnsupportedOperationException");

    // Duplicate sign-up.
    target(
        &fixture.app,
        "AdminCreateUser",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "frank",
            "MessageAction": "SUPPRESS",
        }),
    )
    .await;
    let (status, body) = target(
        &fixture.app,
        "SignUp",
        json!({
            "ClientId": fixture.client_id,
            "Username": "frank",
            "Password": "longpass-1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "UsernameExistsException");

    // Password policy violation surfaces as InvalidPasswordException.
    let (status, body) = target(
        &fixture.app,
        "SignUp",
        json!({
            "ClientId": fixture.client_id,
            "Username": "tiny",
            "Password": "short",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "InvalidPasswordException");
}

#[tokio::test]
async fn groups_flow_and_token_claims() {
    let fixture = setup().await;
    target(
        &fixture.app,
        "AdminCreateUser",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "grace",
            "MessageAction": "SUPPRESS",
        }),
    )
    .await;
    target(
        &fixture.app,
        "AdminSetUserPassword",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "grace",
            "Password": "p@ssword1",
            "Permanent": true,
        }),
    )
    .await;

    let (status, created) = target(
        &fixture.app,
        "CreateGroup",
        json!({
            "UserPoolId": fixture.pool_id,
            "GroupName": "admins",
            "Precedence": 1,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["Group"]["GroupName"], "admins");

    target(
        &fixture.app,
        "AdminAddUserToGroup",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "grace",
            "GroupName": "admins",
        }),
    )
    .await;

    let (_, memberships) = target(
        &fixture.app,
        "AdminListGroupsForUser",
        json!({ "UserPoolId": fixture.pool_id, "Username": "grace" }),
    )
    .await;
    assert_eq!(memberships["Groups"][0]["GroupName"], "admins");

    let (_, members) = target(
        &fixture.app,
        "ListUsersInGroup",
        json!({ "UserPoolId": fixture.pool_id, "GroupName": "admins" }),
    )
    .await;
    assert_eq!(members["Users"][0]["Username"], "grace");

    let (_, login) = target(
        &fixture.app,
        "InitiateAuth",
        json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": fixture.client_id,
            "AuthParameters": { "USERNAME": "grace", "PASSWORD": "p@ssword1" },
        }),
    )
    .await;
    let access_token = login["AuthenticationResult"]["AccessToken"].as_str().unwrap();
    let payload = access_token.split('.').nth(1).unwrap();
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
    assert_eq!(claims["cognito:groups"], json!(["admins"]));
}

#[tokio::test]
async fn list_users_supports_filter_and_pagination() {
    let fixture = setup().await;
    for name in ["alice", "anna", "bob"] {
        target(
            &fixture.app,
            "AdminCreateUser",
            json!({
                "UserPoolId": fixture.pool_id,
                "Username": name,
                "MessageAction": "SUPPRESS",
                "UserAttributes": [
                    { "Name": "email", "Value": format!("{name}@example.com") },
                ],
            }),
        )
        .await;
    }

    let (status, body) = target(
        &fixture.app,
        "ListUsers",
        json!({
            "UserPoolId": fixture.pool_id,
            "Filter": "username ^= \"a\"",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Users"].as_array().unwrap().len(), 2);

    let (_, first_page) = target(
        &fixture.app,
        "ListUsers",
        json!({ "UserPoolId": fixture.pool_id, "Limit": 2 }),
    )
    .await;
    assert_eq!(first_page["Users"].as_array().unwrap().len(), 2);
    let token = first_page["PaginationToken"].as_str().unwrap();

    let (_, second_page) = target(
        &fixture.app,
        "ListUsers",
        json!({
            "UserPoolId": fixture.pool_id,
            "Limit": 2,
            "PaginationToken": token,
        }),
    )
    .await;
    assert_eq!(second_page["Users"].as_array().unwrap().len(), 1);
    assert!(second_page["PaginationToken"].is_null());
}

#[tokio::test]
async fn revoke_token_invalidates_refresh() {
    let fixture = setup().await;
    target(
        &fixture.app,
        "AdminCreateUser",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "henry",
            "MessageAction": "SUPPRESS",
        }),
    )
    .await;
    target(
        &fixture.app,
        "AdminSetUserPassword",
        json!({
            "UserPoolId": fixture.pool_id,
            "Username": "henry",
            "Password": "p@ssword1",
            "Permanent": true,
        }),
    )
    .await;
    let (_, login) = target(
        &fixture.app,
        "InitiateAuth",
        json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": fixture.client_id,
            "AuthParameters": { "USERNAME": "henry", "PASSWORD": "p@ssword1" },
        }),
    )
    .await;
    let refresh = login["AuthenticationResult"]["RefreshToken"].as_str().unwrap();

    let (status, _) = target(
        &fixture.app,
        "RevokeToken",
        json!({ "ClientId": fixture.client_id, "Token": refresh }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = target(
        &fixture.app,
        "InitiateAuth",
        json!({
            "AuthFlow": "REFRESH_TOKEN_AUTH",
            "ClientId": fixture.client_id,
            "AuthParameters": { "REFRESH_TOKEN": refresh },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "NotAuthorizedException");
}
