//! The `graphql_query` host function.
//!
//! `graphql_query(endpoint_ptr, endpoint_len, query_ptr, query_len)` POSTs
//! `{"query": <query>, "variables": {}}` to the endpoint and leaves the
//! response's `data` as the FFI result. Endpoints are subject to the same
//! destination rules as `fetch_url`.

use serde::Deserialize;
use serde_json::{json, Value};

use capsule_common::{Capability, HostFunctionError};
use capsule_core::HostFn;

use crate::guard::check_destination;
use crate::http_outbound::{HttpMethod, OutboundClient, OutboundRequest};

/// Import name of the GraphQL host function.
pub const GRAPHQL_QUERY: &str = "graphql_query";

#[derive(Debug, Deserialize)]
struct GraphQLResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

/// The `graphql_query` host function, owned by the GraphQL capability.
pub fn graphql_query(client: OutboundClient) -> HostFn {
    HostFn::new(GRAPHQL_QUERY, 4, Capability::GraphQL, move |call, args| {
        let endpoint = call.read_str(args[0], args[1])?.to_string();
        let query = call.read_str(args[2], args[3])?.to_string();

        let url = check_destination(call.ctx, &endpoint)?;
        let response = client.send(
            call.ctx,
            OutboundRequest {
                method: HttpMethod::Post,
                url,
                body: Some(request_body(&query)),
                content_type: Some("application/json"),
            },
        )?;

        let data = response_data(&response)?;
        Ok(call.ctx.set_ffi_result(data))
    })
}

fn request_body(query: &str) -> Vec<u8> {
    json!({ "query": query, "variables": {} }).to_string().into_bytes()
}

fn response_data(body: &[u8]) -> Result<Vec<u8>, HostFunctionError> {
    let response: GraphQLResponse = serde_json::from_slice(body).map_err(|e| {
        HostFunctionError::GraphQLFailed {
            message: format!("invalid response: {e}"),
        }
    })?;

    if let Some(first) = response.errors.into_iter().next() {
        return Err(HostFunctionError::GraphQLFailed {
            message: first.message,
        });
    }

    Ok(response.data.unwrap_or(Value::Null).to_string().into_bytes())
}
