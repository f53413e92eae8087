pub mod helix; // Twitch Helix APIクライアント
pub mod identity; // 識別情報・ライブ情報の解決とキャッシュ
pub mod token; // アプリアクセストークン

pub use helix::{ApiError, HelixClient};
pub use identity::{IdentityResolver, LiveDataSource, Resolution};
