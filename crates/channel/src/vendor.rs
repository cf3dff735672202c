//! Closed registry of upstream vendor types
//!
//! Every variant of [`ChannelType`] owns exactly one static [`VendorInfo`]
//! record (display name, default base URL, capability set). The records are
//! declared next to the variant in a single table, so names and URLs cannot
//! drift out of step with the enum. The numeric id is the stable wire form
//! used in persisted channel records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a vendor can serve. Used for admin listings and sanity checks, not
/// for request shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Embeddings,
    Images,
    Audio,
    Video,
    Rerank,
    /// Asynchronous submit/fetch task APIs
    Tasks,
}

/// Static description of a vendor type.
#[derive(Debug, PartialEq, Eq)]
pub struct VendorInfo {
    pub name: &'static str,
    /// Empty when the vendor has no public default endpoint (Azure, AWS, ...)
    pub default_base_url: &'static str,
    pub capabilities: &'static [Capability],
}

impl VendorInfo {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

macro_rules! channel_types {
    ($( $variant:ident = $id:literal => $name:literal, $url:literal, [$($cap:ident),* $(,)?]; )*) => {
        /// Upstream vendor type of a channel.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "u16", into = "u16")]
        #[repr(u16)]
        pub enum ChannelType {
            $( $variant = $id, )*
        }

        impl ChannelType {
            /// Every variant, in id order.
            pub const ALL: &'static [ChannelType] = &[ $( ChannelType::$variant, )* ];

            /// The static registry record for this vendor.
            pub fn info(self) -> &'static VendorInfo {
                match self {
                    $(
                        ChannelType::$variant => {
                            static INFO: VendorInfo = VendorInfo {
                                name: $name,
                                default_base_url: $url,
                                capabilities: &[$(Capability::$cap),*],
                            };
                            &INFO
                        }
                    )*
                }
            }

            /// Look up a variant by its persisted numeric id.
            pub fn from_id(id: u16) -> Option<Self> {
                match id {
                    $( $id => Some(ChannelType::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

channel_types! {
    Unknown = 0 => "Unknown", "", [];
    OpenAI = 1 => "OpenAI", "https://api.openai.com", [Chat, Embeddings, Images, Audio];
    Midjourney = 2 => "Midjourney", "https://oa.api2d.net", [Images, Tasks];
    Azure = 3 => "Azure", "", [Chat, Embeddings, Images, Audio];
    Ollama = 4 => "Ollama", "http://localhost:11434", [Chat, Embeddings];
    MidjourneyPlus = 5 => "MidjourneyPlus", "https://api.openai-sb.com", [Images, Tasks];
    OpenAIMax = 6 => "OpenAIMax", "https://api.openaimax.com", [Chat];
    OhMyGpt = 7 => "OhMyGPT", "https://api.ohmygpt.com", [Chat];
    Custom = 8 => "Custom", "", [Chat, Embeddings];
    Ails = 9 => "AILS", "https://api.caipacity.com", [Chat];
    AiProxy = 10 => "AIProxy", "https://api.aiproxy.io", [Chat];
    PaLM = 11 => "PaLM", "", [Chat];
    Api2Gpt = 12 => "API2GPT", "https://api.api2gpt.com", [Chat];
    Aigc2d = 13 => "AIGC2D", "https://api.aigc2d.com", [Chat];
    Anthropic = 14 => "Anthropic", "https://api.anthropic.com", [Chat];
    Baidu = 15 => "Baidu", "https://aip.baidubce.com", [Chat, Embeddings];
    Zhipu = 16 => "Zhipu", "https://open.bigmodel.cn", [Chat];
    Ali = 17 => "Ali", "https://dashscope.aliyuncs.com", [Chat, Embeddings, Images];
    Xunfei = 18 => "Xunfei", "", [Chat];
    Ai360 = 19 => "360", "https://api.360.cn", [Chat, Embeddings];
    OpenRouter = 20 => "OpenRouter", "https://openrouter.ai/api", [Chat];
    AiProxyLibrary = 21 => "AIProxyLibrary", "https://api.aiproxy.io", [Chat];
    FastGpt = 22 => "FastGPT", "https://fastgpt.run/api/openapi", [Chat];
    Tencent = 23 => "Tencent", "https://hunyuan.tencentcloudapi.com", [Chat];
    Gemini = 24 => "Gemini", "https://generativelanguage.googleapis.com", [Chat, Embeddings, Images];
    Moonshot = 25 => "Moonshot", "https://api.moonshot.cn", [Chat];
    ZhipuV4 = 26 => "ZhipuV4", "https://open.bigmodel.cn", [Chat, Embeddings];
    Perplexity = 27 => "Perplexity", "https://api.perplexity.ai", [Chat];
    LingYiWanWu = 31 => "LingYiWanWu", "https://api.lingyiwanwu.com", [Chat];
    Aws = 33 => "AWS", "", [Chat];
    Cohere = 34 => "Cohere", "https://api.cohere.ai", [Chat, Embeddings, Rerank];
    MiniMax = 35 => "MiniMax", "https://api.minimax.chat", [Chat, Audio];
    SunoApi = 36 => "SunoAPI", "", [Audio, Tasks];
    Dify = 37 => "Dify", "https://api.dify.ai", [Chat];
    Jina = 38 => "Jina", "https://api.jina.ai", [Embeddings, Rerank];
    Cloudflare = 39 => "Cloudflare", "https://api.cloudflare.com", [Chat, Embeddings, Audio];
    SiliconFlow = 40 => "SiliconFlow", "https://api.siliconflow.cn", [Chat, Embeddings, Rerank, Images];
    VertexAi = 41 => "VertexAI", "", [Chat, Embeddings, Images];
    Mistral = 42 => "Mistral", "https://api.mistral.ai", [Chat, Embeddings];
    DeepSeek = 43 => "DeepSeek", "https://api.deepseek.com", [Chat];
    MokaAi = 44 => "MokaAI", "https://api.moka.ai", [Embeddings];
    VolcEngine = 45 => "VolcEngine", "https://ark.cn-beijing.volces.com", [Chat, Embeddings, Images];
    BaiduV2 = 46 => "BaiduV2", "https://qianfan.baidubce.com", [Chat, Embeddings];
    Xinference = 47 => "Xinference", "", [Chat, Embeddings, Rerank];
    Xai = 48 => "xAI", "https://api.x.ai", [Chat, Images];
    Coze = 49 => "Coze", "https://api.coze.cn", [Chat];
    Kling = 50 => "Kling", "https://api.klingai.com", [Video, Tasks];
    Jimeng = 51 => "Jimeng", "https://visual.volcengineapi.com", [Images, Video, Tasks];
    Vidu = 52 => "Vidu", "https://api.vidu.cn", [Video, Tasks];
    Submodel = 53 => "Submodel", "https://llm.submodel.ai", [Chat];
    DoubaoVideo = 54 => "DoubaoVideo", "https://ark.cn-beijing.volces.com", [Video, Tasks];
    Sora = 55 => "Sora", "https://api.openai.com", [Video, Tasks];
    Replicate = 56 => "Replicate", "https://api.replicate.com", [Images, Tasks];
    Codex = 57 => "Codex", "https://chatgpt.com", [Chat];
}

impl ChannelType {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn default_base_url(self) -> &'static str {
        self.info().default_base_url
    }
}

impl From<ChannelType> for u16 {
    fn from(value: ChannelType) -> Self {
        value.id()
    }
}

impl TryFrom<u16> for ChannelType {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ChannelType::from_id(value).ok_or_else(|| format!("unknown channel type id {value}"))
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_round_trip_for_every_variant() {
        for ty in ChannelType::ALL {
            assert_eq!(ChannelType::from_id(ty.id()), Some(*ty), "{ty:?}");
        }
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let ids: Vec<u16> = ChannelType::ALL.iter().map(|t| t.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn names_are_unique() {
        let names: HashSet<&str> = ChannelType::ALL.iter().map(|t| t.name()).collect();
        assert_eq!(names.len(), ChannelType::ALL.len());
    }

    #[test]
    fn default_urls_are_empty_or_http() {
        for ty in ChannelType::ALL {
            let url = ty.default_base_url();
            assert!(
                url.is_empty() || url.starts_with("http://") || url.starts_with("https://"),
                "{ty:?} has malformed default url {url}"
            );
        }
    }

    #[test]
    fn gaps_in_id_space_are_rejected() {
        for gap in [28u16, 29, 30, 32, 58, 999] {
            assert!(ChannelType::from_id(gap).is_none(), "id {gap} should not map");
        }
    }

    #[test]
    fn serde_uses_numeric_id() {
        let json = serde_json::to_string(&ChannelType::Anthropic).unwrap();
        assert_eq!(json, "14");
        let parsed: ChannelType = serde_json::from_str("43").unwrap();
        assert_eq!(parsed, ChannelType::DeepSeek);
        assert!(serde_json::from_str::<ChannelType>("29").is_err());
    }

    #[test]
    fn capability_lookup() {
        assert!(ChannelType::Jina.info().supports(Capability::Rerank));
        assert!(!ChannelType::Jina.info().supports(Capability::Chat));
        assert_eq!(ChannelType::Gemini.to_string(), "Gemini");
    }
}
