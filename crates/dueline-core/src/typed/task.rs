//! TypedTask trait - 型付き Task の定義
//!
//! task_type の文字列と payload の型を 1 か所で対応付けます。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// TypedTask は task_type と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl TypedTask for SendEmail {
///     const TYPE: &'static str = "email";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize` / `DeserializeOwned`: payload は JSON で保存される
/// - `Send + Sync + 'static`: worker のタスクをまたいで Arc に格納できるため
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義。`TaskType::parse` が受け付ける文字だけを使う
    const TYPE: &'static str;
}
