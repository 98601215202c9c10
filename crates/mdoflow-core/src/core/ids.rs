use slotmap::new_key_type;

new_key_type! {
    pub struct VarId;
    pub struct DisciplineId;
    pub struct NamespaceId;
}
