use uuid::Uuid;

/// UUID 派生的 DICOM UID, 2.25 前缀加十进制的 128 位数, 总长不超过 64
pub fn create_uid() -> String {
    let uuid = Uuid::new_v4();
    format!("2.25.{}", u128::from_be_bytes(*uuid.as_bytes()))
}

/// 化名病人姓名由性别和年龄段拼出, 让匿名数据保持人口学上的合理性
pub fn anonymous_patient_name(sex: Option<&str>, age: Option<&str>) -> String {
    let mut name = String::from("Anonymous");
    if let Some(sex) = sex {
        if !sex.is_empty() {
            name.push(' ');
            name.push_str(sex);
        }
    }
    if let Some(age) = age {
        if !age.is_empty() {
            name.push(' ');
            name.push_str(age);
        }
    }
    name
}

/// 化名病人ID直接用一个新 UUID
pub fn anonymous_patient_id() -> String {
    Uuid::new_v4().to_string()
}
