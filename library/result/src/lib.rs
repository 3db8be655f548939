use error::BrokerError;

/// A Result is an alias of [std::result::Result](std::result::Result) with its error variant
/// pre-populated with a `Box<dyn BrokerError>`. This allows for shorter
/// notation throughout the codebase.
///
/// For example, instead of writing...
///
/// ```
/// use error::BrokerError;
///
/// fn assign() -> Result<&'static str, Box<dyn BrokerError>> {
///     Ok("assigned pod: editor-7d9c")
/// }
/// ```
///
/// ...you can simply say...
///
/// ```
/// use result::Result;
///
/// fn assign() -> Result<&'static str> {
///     Ok("assigned pod: editor-7d9c")
/// }
/// ```
///
/// It also helps in easily identifying if any functions are returning errors
/// BEFORE converting them into project native [BrokerError](error::BrokerError)s.
pub type Result<T> = std::result::Result<T, Box<dyn BrokerError>>;
