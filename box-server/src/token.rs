use actix_web::HttpRequest;

/// 取出节点令牌: 优先查询参数 token=, 其次 Authorization Bearer 头
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    for pair in req.query_string().split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    if let Some(auth_header) = req.headers().get("Authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    None
}
