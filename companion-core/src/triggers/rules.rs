//! The default trigger table.

use super::{AdvisoryClass, Hit, Matcher, Suppression, TriggerRule, Window};

/// Related keywords and the situation they point at.
///
/// ASCII keywords match whole words (or whole phrases when they contain
/// spaces); other keywords match anywhere in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordGroup {
    pub label: &'static str,
    pub words: &'static [&'static str],
}

const FOOD: &str = "food";
const MONEY: &str = "money";

/// Needs the character could help with: something to eat, or money.
pub static CARE_GROUPS: &[KeywordGroup] = &[
    KeywordGroup {
        label: FOOD,
        words: &["饿", "好饿", "饿了", "饿死", "饿扁", "hungry", "starving"],
    },
    KeywordGroup {
        label: MONEY,
        words: &["没钱", "穷", "吃土", "月光", "破产", "i'm broke", "so broke", "totally broke", "no money"],
    },
    KeywordGroup {
        label: FOOD,
        words: &["吃饭", "点外卖", "叫外卖", "想吃", "order food", "takeout"],
    },
    KeywordGroup {
        label: FOOD,
        words: &["想喝", "口渴", "渴了", "thirsty"],
    },
    KeywordGroup {
        label: FOOD,
        words: &[
            "肚子疼", "肚子痛", "痛经", "来姨妈", "来大姨妈", "生理期", "难受", "不舒服",
            "cramps", "stomachache", "feel sick",
        ],
    },
];

/// Small events worth writing down for later.
pub static MEMO_GROUPS: &[KeywordGroup] = &[
    KeywordGroup {
        label: "health",
        words: &[
            "姨妈", "大姨妈", "生理期", "例假", "来例假", "痛经", "肚子疼", "头疼", "发烧", "感冒",
            "生病", "难受", "不舒服", "my period", "headache", "fever", "a cold", "sick",
        ],
    },
    KeywordGroup {
        label: "sleep and energy",
        words: &[
            "熬夜", "失眠", "没睡好", "通宵", "很困", "累死", "累趴", "好累", "insomnia",
            "all-nighter", "exhausted", "so tired",
        ],
    },
    KeywordGroup {
        label: "important day",
        words: &[
            "考试", "高考", "中考", "面试", "汇报", "上岸", "ddl", "deadline", "交稿", "交作业",
            "见面", "约会", "纪念日", "exam", "exams", "interview", "presentation", "anniversary", "a date",
        ],
    },
    KeywordGroup {
        label: "plans",
        words: &[
            "过年", "春节", "寒假", "暑假", "回来", "回去", "回国", "回家", "new year", "holiday",
            "vacation", "coming back", "going home",
        ],
    },
];

/// Short, charged replies that deserve a direct answer.
pub static EMOTIONAL_PHRASES: &[&str] = &[
    "滚", "哼", "切", "呵", "去死", "随便", "快点", "你决定", "都行", "都可以", "看着办", "无所谓",
    "算了", "不想说", "懒得", "烦", "闭嘴", "吵死了", "别烦我", "走开", "whatever", "go away",
    "shut up", "forget it", "hmph",
];

/// System-message text recording a declined video call.
pub static DECLINED_CALL_PHRASES: &[&str] = &["用户拒绝了你的视频通话", "declined your video call"];

fn pending_features_text(hit: &Hit) -> String {
    let mut text = String::from("Features waiting for your answer:\n");
    for line in &hit.details {
        text.push_str("- ");
        text.push_str(line);
        text.push('\n');
    }
    text.push_str("Answer each of these in your reply.");
    text
}

fn rejections_text(hit: &Hit) -> String {
    let mut text = String::from("Recently declined by the user:\n");
    for line in &hit.details {
        text.push_str("- ");
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(
        "Respect these decisions and don't keep bringing them up. If the user raises them, respond naturally.",
    );
    text
}

fn couple_outcome_text(hit: &Hit) -> String {
    let outcome = hit.details.first().map(String::as_str).unwrap_or_default();
    let sender = hit.details.get(1).map(String::as_str).unwrap_or_default();
    match (outcome, sender) {
        ("rejected", "character") => {
            "The user turned down your couple-space invitation. Accept it gracefully and don't press the matter.".to_string()
        }
        ("rejected", _) => {
            "You turned down the user's couple-space invitation. Stay consistent with that choice unless something changes.".to_string()
        }
        _ => "Your couple space with the user has ended. Don't act as if you are still a couple.".to_string(),
    }
}

fn care_text(hit: &Hit) -> String {
    let word = hit.details.first().map(String::as_str).unwrap_or_default();
    let label = hit.details.get(1).map(String::as_str).unwrap_or_default();
    if label == MONEY {
        format!(
            "The user just mentioned \"{word}\". If you're close enough, you could send them some money."
        )
    } else {
        format!(
            "The user just mentioned \"{word}\". Depending on who you are, you might order them something to eat or drink, send a little money, or simply show you care. Decide in character."
        )
    }
}

fn memo_text(hit: &Hit) -> String {
    let word = hit.details.first().map(String::as_str).unwrap_or_default();
    let label = hit.details.get(1).map(String::as_str).unwrap_or_default();
    format!(
        "The user mentioned \"{word}\" ({label}). This may matter later; consider writing yourself a memo about it."
    )
}

fn nickname_text(hit: &Hit) -> String {
    format!(
        "You notice the user just changed their nickname to \"{}\". If you're close, you could change yours to match or tease them about it. This is optional.",
        hit.value
    )
}

fn quote_text(hit: &Hit) -> String {
    let quoted: Vec<String> = hit.details.iter().map(|p| format!("\"{p}\"")).collect();
    format!(
        "The user just said {} with strong feeling. Quote it and answer it directly rather than replying in general terms.",
        quoted.join(", ")
    )
}

lazy_static::lazy_static! {
    /// The rules every companion runs by default.
    pub static ref DEFAULT_RULES: Vec<TriggerRule> = vec![
        // Feature status
        TriggerRule::new("pending-features", AdvisoryClass::FeatureStatus, Matcher::PendingFeatures, pending_features_text)
            .with_priority(10)
            .with_window(Window::Messages(20)),
        TriggerRule::new("feature-rejections", AdvisoryClass::FeatureStatus, Matcher::FeatureRejections, rejections_text)
            .with_priority(20)
            .with_window(Window::Messages(50)),
        TriggerRule::new("couple-outcome", AdvisoryClass::FeatureStatus, Matcher::CoupleOutcome, couple_outcome_text)
            .with_priority(30)
            .with_suppression(Suppression::OncePerValue { require_baseline: false }),

        // Nudges
        TriggerRule::new("care", AdvisoryClass::Nudge, Matcher::KeywordGroups(CARE_GROUPS), care_text)
            .with_priority(10)
            .with_window(Window::Sent { count: 3, max_chars: None }),
        TriggerRule::new("memo", AdvisoryClass::Nudge, Matcher::KeywordGroups(MEMO_GROUPS), memo_text)
            .with_priority(20)
            .with_window(Window::Sent { count: 5, max_chars: None }),
        TriggerRule::new("nickname-change", AdvisoryClass::Nudge, Matcher::Nickname, nickname_text)
            .with_priority(30)
            .with_suppression(Suppression::OncePerValue { require_baseline: true }),
        TriggerRule::new("quote", AdvisoryClass::Nudge, Matcher::Phrases(EMOTIONAL_PHRASES), quote_text)
            .with_priority(40)
            .with_window(Window::Sent { count: 5, max_chars: Some(10) }),
    ];
}
